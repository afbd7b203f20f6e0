//! SQLite-backed catalog store.
//!
//! A single connection is shared behind a mutex. The record pipeline holds the lock
//! for the whole of one record (dedupe check plus upsert) so that two records with the
//! same key can never both pass the dedupe check.

pub mod catalog;
pub mod jobs;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, ScraperError};

const SCHEMA: &str = include_str!("../../migrations/001_catalog_schema.sql");

/// How long a writer waits on another process holding the database lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct CatalogDb {
    conn: Arc<Mutex<Connection>>,
}

impl CatalogDb {
    /// Opens (creating if needed) a file database in WAL mode and applies the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!(path = %path.display(), "Opened catalog database");
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Exclusive access to the connection. A panic while holding the lock leaves
    /// SQLite consistent (open transactions roll back on drop), so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.lock();
        f(&guard)
    }

    /// [`with_conn`](Self::with_conn) on the blocking pool, for async callers. The
    /// record worker can hold the lock for a whole record.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| ScraperError::Blocking(e.to_string()))?
    }

    /// [`transaction`](Self::transaction) on the blocking pool.
    pub async fn call_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.transaction(f))
            .await
            .map_err(|e| ScraperError::Blocking(e.to_string()))?
    }

    /// Runs `f` inside a transaction that commits only if `f` succeeds.
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.lock();
        let tx = guard.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(idx, v)).transpose()
}

pub(crate) fn parse_uuid(idx: usize, value: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_uuid(idx: usize, value: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    value.map(|v| parse_uuid(idx, v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T00:00:05.1Z").unwrap().with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2024-01-01T00:00:05.123Z").unwrap().with_timezone(&Utc);
        assert!(format_ts(&early) < format_ts(&late));
        assert_eq!(parse_ts(0, format_ts(&late)).unwrap(), late);
    }

    #[test]
    fn test_schema_applies_to_file_database_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("catalog.db");
        CatalogDb::open(&path).unwrap();
        let db = CatalogDb::open(&path).unwrap();
        let tables: i64 = db
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'resources'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }
}
