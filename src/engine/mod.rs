//! Crawl engines: the pluggable sources of raw records.
//!
//! An engine receives a [`CrawlContext`] and pushes records into a [`RecordSink`].
//! Statistics and the log transcript live in shared handles so the executor still
//! has them when a run is aborted.

pub mod feed_file;
pub mod http_feed;
pub mod rate_limiter;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{CrawlStats, Job, LogLevel};
use crate::types::RawRecord;

pub use feed_file::FeedFileEngine;
pub use http_feed::HttpFeedEngine;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no crawl engine registered for module '{0}'")]
    UnknownModule(String),

    #[error("invalid engine settings: {0}")]
    Settings(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed feed: {0}")]
    Feed(String),

    #[error("crawl cancelled")]
    Cancelled,

    #[error("record consumer went away")]
    ChannelClosed,

    #[error("engine task failed: {0}")]
    Task(String),
}

/// Live statistics shared between a running engine and the executor.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    inner: Arc<Mutex<CrawlStats>>,
}

impl StatsHandle {
    fn update(&self, f: impl FnOnce(&mut CrawlStats)) {
        let mut stats = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }

    pub fn record_request(&self) {
        self.update(|s| s.request_count += 1);
    }

    pub fn record_response(&self, bytes: u64) {
        self.update(|s| {
            s.response_count += 1;
            s.response_bytes += bytes;
        });
    }

    pub fn record_emitted(&self) {
        self.update(|s| s.records_emitted += 1);
    }

    pub fn set_finish_reason(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.update(|s| s.finish_reason = Some(reason));
    }

    pub fn snapshot(&self) -> CrawlStats {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Per-run log transcript, filtered by the job's log level and mirrored to tracing.
#[derive(Debug, Clone)]
pub struct CrawlLog {
    threshold: LogLevel,
    lines: Arc<Mutex<Vec<String>>>,
}

impl CrawlLog {
    pub fn new(threshold: LogLevel) -> Self {
        Self {
            threshold,
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        let message = message.as_ref();
        match level {
            LogLevel::Critical | LogLevel::Error => tracing::error!(target: "crawl", "{}", message),
            LogLevel::Warning => tracing::warn!(target: "crawl", "{}", message),
            LogLevel::Info => tracing::info!(target: "crawl", "{}", message),
            LogLevel::Debug | LogLevel::NotSet => tracing::debug!(target: "crawl", "{}", message),
        }
        if level < self.threshold {
            return;
        }
        let line = format!(
            "{} [{}] {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            level.as_str(),
            message
        );
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).push(line);
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message);
    }

    pub fn transcript(&self) -> String {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).join("\n")
    }
}

/// Everything an engine needs for one run.
#[derive(Debug, Clone)]
pub struct CrawlContext {
    pub job: Job,
    /// Engine defaults with the job's overrides applied
    pub settings: Map<String, Value>,
    pub cancel: CancellationToken,
    pub log: CrawlLog,
    pub stats: StatsHandle,
}

impl CrawlContext {
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }

    pub fn setting_u64(&self, key: &str) -> Result<Option<u64>, EngineError> {
        match self.settings.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| EngineError::Settings(format!("'{key}' must be a non-negative integer"))),
        }
    }
}

/// Where engines push records. Sending waits for channel capacity and gives up
/// as soon as the run is cancelled.
pub struct RecordSink {
    tx: mpsc::Sender<RawRecord>,
    stats: StatsHandle,
    cancel: CancellationToken,
}

impl RecordSink {
    pub fn new(tx: mpsc::Sender<RawRecord>, stats: StatsHandle, cancel: CancellationToken) -> Self {
        Self { tx, stats, cancel }
    }

    pub async fn emit(&self, record: RawRecord) -> Result<(), EngineError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            sent = self.tx.send(record) => {
                sent.map_err(|_| EngineError::ChannelClosed)?;
                self.stats.record_emitted();
                Ok(())
            }
        }
    }
}

#[async_trait]
pub trait CrawlEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Settings used when the job does not override them.
    fn default_settings(&self) -> Map<String, Value> {
        Map::new()
    }

    async fn crawl(&self, ctx: CrawlContext, sink: RecordSink) -> Result<(), EngineError>;
}

/// Shallow merge: job overrides replace engine defaults key by key.
pub fn merge_settings(defaults: Map<String, Value>, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = defaults;
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Maps a job's `module` to the engine that runs it.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn CrawlEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in feed engines.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FeedFileEngine));
        registry.register(Arc::new(HttpFeedEngine::new()));
        registry
    }

    pub fn register(&mut self, engine: Arc<dyn CrawlEngine>) {
        self.engines.insert(engine.name().to_string(), engine);
    }

    pub fn get(&self, module: &str) -> Option<Arc<dyn CrawlEngine>> {
        self.engines.get(module).cloned()
    }

    pub fn modules(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.engines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
