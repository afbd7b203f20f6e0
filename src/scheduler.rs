//! Minimal in-process trigger: runs every active job, a bounded number at a time.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::executor::{ExecutionError, ExecutionSummary, Executor};
use crate::storage::jobs;

#[derive(Debug)]
pub struct JobRunReport {
    pub job: String,
    pub outcome: std::result::Result<ExecutionSummary, ExecutionError>,
}

/// Runs all active jobs concurrently, at most `max_parallel` at once. Each job's
/// result is reported separately; one failing job never stops the others.
pub async fn run_active(executor: &Executor, max_parallel: usize) -> Result<Vec<JobRunReport>> {
    let active = executor.db().call(jobs::list_active_jobs).await?;
    info!(jobs = active.len(), max_parallel, "Starting active jobs");

    let permits = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut tasks = JoinSet::new();
    for job in active {
        let executor = executor.clone();
        let permits = permits.clone();
        tasks.spawn(async move {
            // The semaphore lives as long as this function and is never closed
            let _permit = permits.acquire_owned().await.ok();
            let outcome = executor.execute(job.id).await;
            JobRunReport { job: job.name, outcome }
        });
    }

    let mut reports = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => {
                match &report.outcome {
                    Ok(summary) => info!(
                        job = %report.job,
                        items_scraped = summary.execution.items_scraped.unwrap_or(0),
                        "Job finished"
                    ),
                    Err(e) => warn!(job = %report.job, "Job did not complete: {}", e),
                }
                reports.push(report);
            }
            Err(e) => error!("Job task panicked: {}", e),
        }
    }
    reports.sort_by(|a, b| a.job.cmp(&b.job));
    Ok(reports)
}

/// Repeats [`run_active`] every `interval` until `shutdown` is cancelled. A round
/// still in progress when the next tick arrives delays that tick.
pub async fn run_periodic(
    executor: &Executor,
    max_parallel: usize,
    interval: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Scheduler stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                let reports = run_active(executor, max_parallel).await?;
                let failed = reports.iter().filter(|r| r.outcome.is_err()).count();
                info!(jobs = reports.len(), failed, "Scheduled round finished");
            }
        }
    }
}
