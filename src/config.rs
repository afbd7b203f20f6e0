use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::domain::LogLevel;
use crate::error::{Result, ScraperError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub executor: ExecutorConfig,
    pub health: HealthConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
    /// Prometheus listener; only set from the environment
    #[serde(skip)]
    pub metrics_addr: Option<SocketAddr>,
    pub jobs: Vec<JobDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DB_PATH),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub run_timeout_secs: u64,
    pub channel_capacity: usize,
    pub max_parallel_jobs: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: DEFAULT_RUN_TIMEOUT_SECS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_parallel_jobs: DEFAULT_MAX_PARALLEL_JOBS,
        }
    }
}

impl ExecutorConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// Thresholds for classifying a run's yield against the rolling average.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Number of prior executions averaged
    pub window: usize,
    pub faulty_ratio: f64,
    pub warning_ratio: f64,
    pub improved_ratio: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 3,
            faulty_ratio: 0.4,
            warning_ratio: 0.7,
            improved_ratio: 1.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Refresh scalar fields of resources that already exist
    pub refresh_existing: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { refresh_existing: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub file_name: String,
    /// Used when `RUST_LOG` is not set
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_LOG_DIR),
            file_name: DEFAULT_LOG_FILE.to_string(),
            default_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A `[[jobs]]` entry, imported into the store by name.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct JobDefinition {
    pub name: String,
    pub module: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl Config {
    /// Loads `path`. A missing file is only tolerated for the default path, in which
    /// case every section takes its defaults. Environment overrides are applied last.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && path == Path::new(DEFAULT_CONFIG_PATH) => {
                Self::default()
            }
            Err(e) => {
                return Err(ScraperError::Config(format!(
                    "Failed to read config file '{}': {}",
                    path.display(),
                    e
                )))
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup(ENV_DB_PATH) {
            self.database.path = PathBuf::from(path);
        }
        if let Some(secs) = lookup(ENV_RUN_TIMEOUT_SECS) {
            self.executor.run_timeout_secs = secs
                .trim()
                .parse()
                .map_err(|_| ScraperError::Config(format!("{ENV_RUN_TIMEOUT_SECS} must be an integer, got '{secs}'")))?;
        }
        if let Some(addr) = lookup(ENV_METRICS_ADDR) {
            self.metrics_addr = Some(
                addr.trim()
                    .parse()
                    .map_err(|_| ScraperError::Config(format!("{ENV_METRICS_ADDR} is not a socket address: '{addr}'")))?,
            );
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.run_timeout_secs == 0 {
            return Err(ScraperError::Config("executor.run_timeout_secs must be positive".to_string()));
        }
        if self.executor.run_timeout_secs > MAX_RUN_TIMEOUT_SECS {
            return Err(ScraperError::Config(format!(
                "executor.run_timeout_secs must be at most {MAX_RUN_TIMEOUT_SECS}, got {}",
                self.executor.run_timeout_secs
            )));
        }
        if self.executor.channel_capacity == 0 {
            return Err(ScraperError::Config("executor.channel_capacity must be positive".to_string()));
        }
        if self.executor.max_parallel_jobs == 0 {
            return Err(ScraperError::Config("executor.max_parallel_jobs must be positive".to_string()));
        }
        let health = &self.health;
        if health.window == 0 {
            return Err(ScraperError::Config("health.window must be positive".to_string()));
        }
        if !(0.0 < health.faulty_ratio
            && health.faulty_ratio <= health.warning_ratio
            && health.warning_ratio <= 1.0
            && health.improved_ratio >= 1.0)
        {
            return Err(ScraperError::Config(
                "health ratios must satisfy 0 < faulty <= warning <= 1 <= improved".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() || job.module.trim().is_empty() {
                return Err(ScraperError::Config("every job needs a name and a module".to_string()));
            }
            if !names.insert(job.name.as_str()) {
                return Err(ScraperError::Config(format!("duplicate job name '{}'", job.name)));
            }
        }
        Ok(())
    }
}
