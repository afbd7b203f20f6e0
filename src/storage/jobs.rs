use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};
use uuid::Uuid;

use super::{format_ts, parse_opt_ts, parse_ts, parse_uuid};
use crate::config::JobDefinition;
use crate::domain::{Execution, ExecutionStats, ExecutionStatus, Job, LogLevel};
use crate::error::{Result, ScraperError};

const JOB_COLUMNS: &str = "id, name, module, active, fault, settings, log_level, created_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let settings: String = row.get(5)?;
    let settings = serde_json::from_str(&settings)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e)))?;
    let log_level: String = row.get(6)?;
    let log_level = log_level.parse::<LogLevel>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;
    Ok(Job {
        id: parse_uuid(0, row.get(0)?)?,
        name: row.get(1)?,
        module: row.get(2)?,
        active: row.get(3)?,
        fault: row.get(4)?,
        settings,
        log_level,
        created_at: parse_ts(7, row.get(7)?)?,
    })
}

/// Imports job definitions, matching existing jobs by name. Fault flags and run
/// history of existing jobs are preserved.
pub fn import_jobs(conn: &Connection, definitions: &[JobDefinition]) -> Result<Vec<Job>> {
    let tx = conn.unchecked_transaction()?;
    let mut jobs = Vec::with_capacity(definitions.len());
    for definition in definitions {
        let settings = serde_json::to_string(&definition.settings)?;
        tx.execute(
            "INSERT INTO jobs (id, name, module, active, fault, settings, log_level, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
                module = excluded.module,
                active = excluded.active,
                settings = excluded.settings,
                log_level = excluded.log_level",
            params![
                Uuid::new_v4().to_string(),
                definition.name,
                definition.module,
                definition.active,
                settings,
                definition.log_level.as_str(),
                format_ts(&Utc::now())
            ],
        )?;
        let job = get_job_by_name(&tx, &definition.name)?
            .ok_or_else(|| ScraperError::JobNotFound(definition.name.clone()))?;
        jobs.push(job);
    }
    tx.commit()?;
    info!(count = jobs.len(), "Imported job definitions");
    Ok(jobs)
}

pub fn get_job(conn: &Connection, id: Uuid) -> Result<Option<Job>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id.to_string()], job_from_row).optional()?)
}

pub fn get_job_by_name(conn: &Connection, name: &str) -> Result<Option<Job>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1");
    Ok(conn.query_row(&sql, params![name], job_from_row).optional()?)
}

pub fn list_jobs(conn: &Connection) -> Result<Vec<Job>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY name");
    let mut stmt = conn.prepare(&sql)?;
    let jobs = stmt
        .query_map([], job_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(jobs)
}

pub fn list_active_jobs(conn: &Connection) -> Result<Vec<Job>> {
    Ok(list_jobs(conn)?.into_iter().filter(|job| job.active).collect())
}

pub fn set_fault(conn: &Connection, job_id: Uuid, fault: bool) -> Result<()> {
    let changed = conn.execute(
        "UPDATE jobs SET fault = ?1 WHERE id = ?2",
        params![fault, job_id.to_string()],
    )?;
    if changed == 0 {
        return Err(ScraperError::JobNotFound(job_id.to_string()));
    }
    Ok(())
}

const EXECUTION_COLUMNS: &str = "id, job_id, status, started_at, ended_at, stats, log, items_scraped";

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let status: String = row.get(2)?;
    let status = status.parse::<ExecutionStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;
    let stats: String = row.get(5)?;
    let stats: ExecutionStats = serde_json::from_str(&stats)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e)))?;
    Ok(Execution {
        id: parse_uuid(0, row.get(0)?)?,
        job_id: parse_uuid(1, row.get(1)?)?,
        status,
        started_at: parse_ts(3, row.get(3)?)?,
        ended_at: parse_opt_ts(4, row.get(4)?)?,
        stats,
        log: row.get(6)?,
        items_scraped: row.get(7)?,
    })
}

/// Inserts a fresh execution in the `Created` state.
fn new_execution(job_id: Uuid, started_at: DateTime<Utc>) -> Execution {
    Execution {
        id: Uuid::new_v4(),
        job_id,
        status: ExecutionStatus::Created,
        started_at,
        ended_at: None,
        stats: ExecutionStats::default(),
        log: String::new(),
        items_scraped: None,
    }
}

pub fn create_execution(conn: &Connection, job_id: Uuid, started_at: DateTime<Utc>) -> Result<Execution> {
    let execution = new_execution(job_id, started_at);
    conn.execute(
        "INSERT INTO executions (id, job_id, status, started_at, stats, log)
         VALUES (?1, ?2, ?3, ?4, ?5, '')",
        params![
            execution.id.to_string(),
            job_id.to_string(),
            execution.status.as_str(),
            format_ts(&started_at),
            serde_json::to_string(&execution.stats)?
        ],
    )?;
    Ok(execution)
}

/// Creates the execution for a new run unless the job already has an unfinished one,
/// which may belong to another process sharing the database. Returns `None` when the
/// job is taken.
///
/// Unfinished executions started before `stale_before` are left over from runs that
/// died without finalizing. They are closed as errored and no longer block the job.
pub fn claim_execution(
    conn: &Connection,
    job_id: Uuid,
    started_at: DateTime<Utc>,
    stale_before: DateTime<Utc>,
) -> Result<Option<Execution>> {
    let tx = conn.unchecked_transaction()?;
    let abandoned = tx.execute(
        "UPDATE executions SET status = ?1, ended_at = ?2
         WHERE job_id = ?3 AND ended_at IS NULL AND started_at < ?4",
        params![
            ExecutionStatus::Errored.as_str(),
            format_ts(&started_at),
            job_id.to_string(),
            format_ts(&stale_before)
        ],
    )?;
    if abandoned > 0 {
        warn!(%job_id, abandoned, "Closed unfinished executions older than the run timeout");
    }

    let execution = new_execution(job_id, started_at);
    let inserted = tx.execute(
        "INSERT INTO executions (id, job_id, status, started_at, stats, log)
         SELECT ?1, ?2, ?3, ?4, ?5, ''
         WHERE NOT EXISTS (SELECT 1 FROM executions WHERE job_id = ?2 AND ended_at IS NULL)",
        params![
            execution.id.to_string(),
            job_id.to_string(),
            execution.status.as_str(),
            format_ts(&started_at),
            serde_json::to_string(&execution.stats)?
        ],
    )?;
    tx.commit()?;
    Ok((inserted == 1).then_some(execution))
}

pub fn mark_running(conn: &Connection, execution_id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE executions SET status = ?1 WHERE id = ?2 AND ended_at IS NULL",
        params![ExecutionStatus::Running.as_str(), execution_id.to_string()],
    )?;
    Ok(())
}

/// Writes the terminal state of an execution. A finalized execution is immutable,
/// so finalizing twice is an error.
pub fn finalize_execution(conn: &Connection, execution: &Execution) -> Result<()> {
    let ended_at = execution
        .ended_at
        .ok_or_else(|| ScraperError::Corrupt(format!("execution {} has no end time", execution.id)))?;
    if !execution.status.is_terminal() {
        return Err(ScraperError::Corrupt(format!(
            "execution {} finalized with non-terminal status {}",
            execution.id, execution.status
        )));
    }
    let changed = conn.execute(
        "UPDATE executions SET status = ?1, ended_at = ?2, stats = ?3, log = ?4, items_scraped = ?5
         WHERE id = ?6 AND ended_at IS NULL",
        params![
            execution.status.as_str(),
            format_ts(&ended_at),
            serde_json::to_string(&execution.stats)?,
            execution.log,
            execution.items_scraped,
            execution.id.to_string()
        ],
    )?;
    if changed == 0 {
        return Err(ScraperError::Corrupt(format!(
            "execution {} is missing or already finalized",
            execution.id
        )));
    }
    Ok(())
}

pub fn get_execution(conn: &Connection, id: Uuid) -> Result<Option<Execution>> {
    let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id.to_string()], execution_from_row).optional()?)
}

/// Most recent executions of a job, newest first.
pub fn list_executions(conn: &Connection, job_id: Uuid, limit: usize) -> Result<Vec<Execution>> {
    let sql = format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions WHERE job_id = ?1
         ORDER BY started_at DESC, rowid DESC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let executions = stmt
        .query_map(params![job_id.to_string(), limit as i64], execution_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(executions)
}

/// Finalized, non-errored executions of a job other than `exclude`, newest first.
pub fn recent_scored_executions(
    conn: &Connection,
    job_id: Uuid,
    exclude: Uuid,
    limit: usize,
) -> Result<Vec<Execution>> {
    let sql = format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions
         WHERE job_id = ?1 AND id != ?2 AND ended_at IS NOT NULL AND status IN (?3, ?4)
         ORDER BY started_at DESC, rowid DESC LIMIT ?5"
    );
    let mut stmt = conn.prepare(&sql)?;
    let executions = stmt
        .query_map(
            params![
                job_id.to_string(),
                exclude.to_string(),
                ExecutionStatus::Completed.as_str(),
                ExecutionStatus::TimedOut.as_str(),
                limit as i64
            ],
            execution_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(executions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CatalogDb;
    use serde_json::json;

    fn definition(name: &str, module: &str) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            module: module.to_string(),
            active: true,
            log_level: LogLevel::Info,
            settings: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_import_preserves_fault_and_identity() {
        let db = CatalogDb::open_in_memory().unwrap();
        let conn = db.lock();
        let first = import_jobs(&conn, &[definition("coursera", "feed_file")]).unwrap();
        set_fault(&conn, first[0].id, true).unwrap();

        let mut changed = definition("coursera", "http_feed");
        changed.active = false;
        changed.settings.insert("urls".to_string(), json!(["https://example.com/feed"]));
        let second = import_jobs(&conn, &[changed]).unwrap();

        assert_eq!(first[0].id, second[0].id);
        assert!(second[0].fault);
        assert!(!second[0].active);
        assert_eq!(second[0].module, "http_feed");
        assert!(second[0].settings.contains_key("urls"));
        assert!(list_active_jobs(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_finalized_execution_is_immutable() {
        let db = CatalogDb::open_in_memory().unwrap();
        let conn = db.lock();
        let job = import_jobs(&conn, &[definition("edx", "feed_file")]).unwrap().remove(0);
        let mut execution = create_execution(&conn, job.id, Utc::now()).unwrap();
        mark_running(&conn, execution.id).unwrap();

        execution.status = ExecutionStatus::Completed;
        execution.ended_at = Some(Utc::now());
        execution.items_scraped = Some(7);
        finalize_execution(&conn, &execution).unwrap();
        assert!(finalize_execution(&conn, &execution).is_err());

        let stored = get_execution(&conn, execution.id).unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(stored.items_scraped, Some(7));
        assert!(stored.is_finalized());
    }

    #[test]
    fn test_scored_history_skips_errored_and_running() {
        let db = CatalogDb::open_in_memory().unwrap();
        let conn = db.lock();
        let job = import_jobs(&conn, &[definition("udacity", "feed_file")]).unwrap().remove(0);

        for status in [ExecutionStatus::Completed, ExecutionStatus::Errored, ExecutionStatus::TimedOut] {
            let mut execution = create_execution(&conn, job.id, Utc::now()).unwrap();
            execution.status = status;
            execution.ended_at = Some(Utc::now());
            execution.items_scraped = Some(1);
            finalize_execution(&conn, &execution).unwrap();
        }
        let current = create_execution(&conn, job.id, Utc::now()).unwrap();

        let history = recent_scored_executions(&conn, job.id, current.id, 3).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, ExecutionStatus::TimedOut);
        assert_eq!(history[1].status, ExecutionStatus::Completed);
        assert_eq!(list_executions(&conn, job.id, 10).unwrap().len(), 4);
    }

    #[test]
    fn test_claim_refused_while_an_execution_is_unfinished() {
        let db = CatalogDb::open_in_memory().unwrap();
        let conn = db.lock();
        let job = import_jobs(&conn, &[definition("khan", "feed_file")]).unwrap().remove(0);
        let now = Utc::now();
        let stale_before = now - chrono::Duration::hours(1);

        let mut first = claim_execution(&conn, job.id, now, stale_before).unwrap().unwrap();
        assert!(claim_execution(&conn, job.id, Utc::now(), stale_before).unwrap().is_none());
        assert_eq!(list_executions(&conn, job.id, 10).unwrap().len(), 1);

        first.status = ExecutionStatus::Completed;
        first.ended_at = Some(Utc::now());
        first.items_scraped = Some(3);
        finalize_execution(&conn, &first).unwrap();
        assert!(claim_execution(&conn, job.id, Utc::now(), stale_before).unwrap().is_some());
    }

    #[test]
    fn test_claim_closes_stale_executions() {
        let db = CatalogDb::open_in_memory().unwrap();
        let conn = db.lock();
        let job = import_jobs(&conn, &[definition("futurelearn", "feed_file")]).unwrap().remove(0);
        let now = Utc::now();
        let crashed = create_execution(&conn, job.id, now - chrono::Duration::hours(2)).unwrap();
        mark_running(&conn, crashed.id).unwrap();

        let claimed = claim_execution(&conn, job.id, now, now - chrono::Duration::hours(1)).unwrap();
        assert!(claimed.is_some());

        let crashed = get_execution(&conn, crashed.id).unwrap().unwrap();
        assert_eq!(crashed.status, ExecutionStatus::Errored);
        assert!(crashed.is_finalized());
    }

    #[test]
    fn test_unknown_stored_log_level_is_an_error() {
        let db = CatalogDb::open_in_memory().unwrap();
        let conn = db.lock();
        let job = import_jobs(&conn, &[definition("alison", "feed_file")]).unwrap().remove(0);
        conn.execute(
            "UPDATE jobs SET log_level = 'VERBOSE' WHERE id = ?1",
            params![job.id.to_string()],
        )
        .unwrap();

        let err = get_job(&conn, job.id).unwrap_err();
        assert!(matches!(
            err,
            ScraperError::Database(rusqlite::Error::FromSqlConversionFailure(6, _, _))
        ));
        assert!(list_jobs(&conn).is_err());
    }
}
