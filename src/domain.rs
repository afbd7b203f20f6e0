use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::pipeline::PipelineCounters;

/// Verbosity captured into an execution's log transcript.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    #[serde(rename = "NOTSET")]
    NotSet,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::NotSet => "NOTSET",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NOTSET" | "" => Ok(LogLevel::NotSet),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// A configured crawl target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    /// Selects the crawl engine that runs this job
    pub module: String,
    pub active: bool,
    /// Set by the health monitor when the job stops yielding records
    pub fault: bool,
    /// Per-job overrides merged over the engine defaults
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub log_level: LogLevel,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Created,
    Running,
    Completed,
    TimedOut,
    Errored,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Created => "created",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::TimedOut | ExecutionStatus::Errored
        )
    }

    /// Errored runs are kept for inspection but never feed the rolling yield average
    pub fn counts_toward_health(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::TimedOut)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ExecutionStatus::Created),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "timed_out" => Ok(ExecutionStatus::TimedOut),
            "errored" => Ok(ExecutionStatus::Errored),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// Statistics reported by the crawl engine for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CrawlStats {
    pub request_count: u64,
    pub response_count: u64,
    pub response_bytes: u64,
    pub records_emitted: u64,
    pub elapsed_seconds: f64,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStats {
    pub crawl: CrawlStats,
    pub pipeline: PipelineCounters,
}

/// One run of a [`Job`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stats: ExecutionStats,
    pub log: String,
    pub items_scraped: Option<i64>,
}

impl Execution {
    pub fn responses(&self) -> u64 {
        self.stats.crawl.response_count
    }

    pub fn finish_reason(&self) -> &str {
        self.stats.crawl.finish_reason.as_deref().unwrap_or("---")
    }

    pub fn seconds(&self) -> u64 {
        self.stats.crawl.elapsed_seconds.max(0.0) as u64
    }

    pub fn download_size(&self) -> String {
        human_bytes(self.stats.crawl.response_bytes)
    }

    pub fn is_finalized(&self) -> bool {
        self.ended_at.is_some()
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return if bytes == 1 {
            "1 byte".to_string()
        } else {
            format!("{bytes} bytes")
        };
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// A catalog source (platform) such as a MOOC provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Format {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Level {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Language {
    pub iso_code: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contributor {
    pub id: Uuid,
    pub source_id: Uuid,
    pub local_id: String,
    pub name: String,
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
}

/// A catalog resource as stored, with its relationship sets resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedResource {
    pub id: Uuid,
    pub source_id: Uuid,
    pub local_id: String,
    pub name: String,
    pub description: String,
    pub short_description: Option<String>,
    pub html_description: Option<String>,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub is_free: bool,
    pub is_limited_free: bool,
    pub is_active: bool,
    pub has_certificate: bool,
    pub price: Option<f64>,
    pub duration_hours: Option<f64>,
    pub reviews_count: Option<i64>,
    pub reviews_rating: Option<f64>,
    pub enrollment_count: Option<i64>,
    pub format_id: Option<Uuid>,
    pub level_id: Option<Uuid>,
    pub last_update: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub contributor_ids: Vec<Uuid>,
    pub language_codes: Vec<String>,
    pub tag_names: Vec<String>,
}
