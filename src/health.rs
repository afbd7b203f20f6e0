//! Yield-based health scoring for crawl jobs.
//!
//! A completed run is compared with the average yield of the job's most recent prior
//! runs. A sharp drop (or an empty run) marks the job faulty. The monitor only ever
//! sets the fault flag; clearing it is an operator action.

use rusqlite::Connection;
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use crate::config::HealthConfig;
use crate::domain::{Execution, Job};
use crate::error::Result;
use crate::storage::jobs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Faulty,
    Improved,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Faulty => "faulty",
            HealthStatus::Improved => "improved",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub items_scraped: i64,
    /// Rolling average of the prior runs, when there was enough history
    pub average: Option<f64>,
    pub ratio: Option<f64>,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    /// Classifies a run that just completed. Must be called on the connection (or
    /// transaction) that finalized `execution`, after the finalization write.
    pub fn evaluate(&self, conn: &Connection, job: &Job, execution: &Execution) -> Result<HealthReport> {
        let items = execution.items_scraped.unwrap_or(0);

        if items == 0 {
            jobs::set_fault(conn, job.id, true)?;
            warn!(job = %job.name, execution_id = %execution.id, "Run yielded no items; job marked faulty");
            return Ok(HealthReport {
                status: HealthStatus::Faulty,
                items_scraped: 0,
                average: None,
                ratio: None,
                message: "no items scraped".to_string(),
            });
        }

        let history = jobs::recent_scored_executions(conn, job.id, execution.id, self.config.window)?;
        if history.len() < self.config.window {
            info!(
                job = %job.name,
                prior_runs = history.len(),
                "Insufficient history for health scoring"
            );
            return Ok(HealthReport {
                status: HealthStatus::Healthy,
                items_scraped: items,
                average: None,
                ratio: None,
                message: format!("insufficient history ({} of {} prior runs)", history.len(), self.config.window),
            });
        }

        let average = rolling_average(&history, items);
        let ratio = items as f64 / average;
        let status = self.classify(ratio);

        let message = format!("{items} items vs rolling average {average:.1} (ratio {ratio:.2})");
        match status {
            HealthStatus::Faulty => {
                jobs::set_fault(conn, job.id, true)?;
                warn!(job = %job.name, execution_id = %execution.id, ratio, "Yield dropped sharply; job marked faulty");
            }
            HealthStatus::Warning => {
                warn!(job = %job.name, execution_id = %execution.id, ratio, "Yield below normal");
            }
            HealthStatus::Improved | HealthStatus::Healthy => {
                info!(job = %job.name, execution_id = %execution.id, ratio, status = %status, "Health evaluated");
            }
        }

        Ok(HealthReport {
            status,
            items_scraped: items,
            average: Some(average),
            ratio: Some(ratio),
            message,
        })
    }

    fn classify(&self, ratio: f64) -> HealthStatus {
        if ratio < self.config.faulty_ratio {
            HealthStatus::Faulty
        } else if ratio < self.config.warning_ratio {
            HealthStatus::Warning
        } else if ratio > self.config.improved_ratio {
            HealthStatus::Improved
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Mean of the non-zero prior yields; falls back to the current yield when every
/// prior run was empty.
fn rolling_average(history: &[Execution], current: i64) -> f64 {
    let counts: Vec<i64> = history
        .iter()
        .map(|e| e.items_scraped.unwrap_or(0))
        .filter(|count| *count > 0)
        .collect();
    if counts.is_empty() {
        current as f64
    } else {
        counts.iter().sum::<i64>() as f64 / counts.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_boundaries() {
        let monitor = HealthMonitor::default();
        assert_eq!(monitor.classify(0.39), HealthStatus::Faulty);
        assert_eq!(monitor.classify(0.4), HealthStatus::Warning);
        assert_eq!(monitor.classify(0.69), HealthStatus::Warning);
        assert_eq!(monitor.classify(0.7), HealthStatus::Healthy);
        assert_eq!(monitor.classify(1.3), HealthStatus::Healthy);
        assert_eq!(monitor.classify(1.31), HealthStatus::Improved);
    }

    #[test]
    fn test_rolling_average_ignores_empty_runs() {
        let execution = |items: i64| Execution {
            id: uuid::Uuid::new_v4(),
            job_id: uuid::Uuid::new_v4(),
            status: crate::domain::ExecutionStatus::Completed,
            started_at: chrono::Utc::now(),
            ended_at: Some(chrono::Utc::now()),
            stats: Default::default(),
            log: String::new(),
            items_scraped: Some(items),
        };
        assert_eq!(rolling_average(&[execution(100), execution(0), execution(50)], 10), 75.0);
        assert_eq!(rolling_average(&[execution(0), execution(0), execution(0)], 10), 10.0);
    }
}
