//! Runs one crawl job end to end.
//!
//! The engine runs on its own task and pushes records through a bounded channel to a
//! blocking worker that owns the [`Pipeline`]. The whole run is bounded by a wall-clock
//! deadline; on expiry the run is cancelled, the engine task aborted, and the execution
//! finalized with whatever the worker had processed.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{Config, PipelineConfig};
use crate::constants::{FINISH_ERROR, FINISH_FINISHED, FINISH_TIMEOUT};
use crate::domain::{Execution, ExecutionStats, ExecutionStatus, Job};
use crate::engine::{merge_settings, CrawlContext, CrawlLog, EngineError, EngineRegistry, RecordSink, StatsHandle};
use crate::error::ScraperError;
use crate::health::{HealthMonitor, HealthReport};
use crate::metrics;
use crate::pipeline::{DropReason, Outcome, Pipeline, PipelineCounters};
use crate::storage::{jobs, CatalogDb};
use crate::types::RawRecord;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("job '{0}' already has a run in progress")]
    AlreadyRunning(String),

    #[error("run of job '{job}' timed out after {timeout:?}")]
    TimedOut {
        job: String,
        timeout: Duration,
        execution: Box<Execution>,
    },

    #[error("run of job '{job}' failed: {error}")]
    Engine {
        job: String,
        execution: Box<Execution>,
        #[source]
        error: EngineError,
    },

    #[error("record worker of job '{job}' crashed: {reason}")]
    Worker {
        job: String,
        execution: Box<Execution>,
        reason: String,
    },

    #[error(transparent)]
    Storage(#[from] ScraperError),
}

impl ExecutionError {
    /// The finalized execution, for errors raised after the run started.
    pub fn execution(&self) -> Option<&Execution> {
        match self {
            ExecutionError::TimedOut { execution, .. }
            | ExecutionError::Engine { execution, .. }
            | ExecutionError::Worker { execution, .. } => Some(execution),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub job: Job,
    pub execution: Execution,
    /// Present for completed runs
    pub health: Option<HealthReport>,
}

/// Marks a job as running for as long as it is alive.
struct InFlightGuard {
    registry: Arc<Mutex<HashSet<Uuid>>>,
    job_id: Uuid,
}

impl InFlightGuard {
    fn acquire(registry: &Arc<Mutex<HashSet<Uuid>>>, job: &Job) -> Result<Self, ExecutionError> {
        let mut running = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(job.id) {
            return Err(ExecutionError::AlreadyRunning(job.name.clone()));
        }
        Ok(Self {
            registry: registry.clone(),
            job_id: job.id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

/// Per-run shared state that outlives an aborted engine.
struct RunState {
    started: Instant,
    stats: StatsHandle,
    log: CrawlLog,
    counters: Arc<Mutex<PipelineCounters>>,
}

impl RunState {
    fn counters(&self) -> PipelineCounters {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Clone)]
pub struct Executor {
    db: CatalogDb,
    registry: Arc<EngineRegistry>,
    pipeline: PipelineConfig,
    health: HealthMonitor,
    run_timeout: Duration,
    channel_capacity: usize,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl Executor {
    pub fn new(db: CatalogDb, registry: EngineRegistry, config: &Config) -> Self {
        Self {
            db,
            registry: Arc::new(registry),
            pipeline: config.pipeline.clone(),
            health: HealthMonitor::new(config.health.clone()),
            run_timeout: config.executor.run_timeout(),
            channel_capacity: config.executor.channel_capacity.max(1),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn db(&self) -> &CatalogDb {
        &self.db
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&job_id)
    }

    pub async fn execute_by_name(&self, name: &str) -> Result<ExecutionSummary, ExecutionError> {
        let lookup = name.to_string();
        let job = self
            .db
            .call(move |conn| jobs::get_job_by_name(conn, &lookup))
            .await?
            .ok_or_else(|| ExecutionError::JobNotFound(name.to_string()))?;
        self.execute(job.id).await
    }

    /// Runs the job once. Rejected while another run of the same job is in progress,
    /// in this process or in any other sharing the database. Timeouts and engine
    /// failures are returned as errors after the execution has been finalized.
    pub async fn execute(&self, job_id: Uuid) -> Result<ExecutionSummary, ExecutionError> {
        let job = self
            .db
            .call(move |conn| jobs::get_job(conn, job_id))
            .await?
            .ok_or_else(|| ExecutionError::JobNotFound(job_id.to_string()))?;
        let _guard = InFlightGuard::acquire(&self.in_flight, &job)?;

        let deadline = tokio::time::Instant::now()
            .checked_add(self.run_timeout)
            .ok_or_else(|| ScraperError::Config(format!("run timeout {:?} is out of range", self.run_timeout)))?;
        let started_at = Utc::now();
        // Anything unfinished from before this has outlived its own timeout
        let stale_before = chrono::Duration::from_std(self.run_timeout)
            .ok()
            .and_then(|timeout| started_at.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let execution = self
            .db
            .call(move |conn| jobs::claim_execution(conn, job_id, started_at, stale_before))
            .await?
            .ok_or_else(|| ExecutionError::AlreadyRunning(job.name.clone()))?;

        let span = info_span!("crawl_run", job_id = %job.id, job = %job.name, execution_id = %execution.id);
        self.run(job, execution, deadline).instrument(span).await
    }

    async fn run(
        &self,
        job: Job,
        mut execution: Execution,
        deadline: tokio::time::Instant,
    ) -> Result<ExecutionSummary, ExecutionError> {
        let state = RunState {
            started: Instant::now(),
            stats: StatsHandle::default(),
            log: CrawlLog::new(job.log_level),
            counters: Arc::new(Mutex::new(PipelineCounters::default())),
        };
        let cancel = CancellationToken::new();

        let execution_id = execution.id;
        self.db.call(move |conn| jobs::mark_running(conn, execution_id)).await?;
        execution.status = ExecutionStatus::Running;
        state
            .log
            .info(format!("Starting job '{}' with module '{}'", job.name, job.module));

        let Some(engine) = self.registry.get(&job.module) else {
            let error = EngineError::UnknownModule(job.module.clone());
            state.log.error(error.to_string());
            let (execution, _) = self.finalize(&job, execution, &state, ExecutionStatus::Errored).await?;
            return Err(ExecutionError::Engine {
                job: job.name,
                execution: Box::new(execution),
                error,
            });
        };

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let ctx = CrawlContext {
            job: job.clone(),
            settings: merge_settings(engine.default_settings(), &job.settings),
            cancel: cancel.clone(),
            log: state.log.clone(),
            stats: state.stats.clone(),
        };
        let sink = RecordSink::new(tx, state.stats.clone(), cancel.clone());
        let mut engine_task = tokio::spawn(async move { engine.crawl(ctx, sink).await }.in_current_span());

        let pipeline = Pipeline::new(self.db.clone(), &self.pipeline);
        let worker_cancel = cancel.clone();
        let worker_log = state.log.clone();
        let worker_counters = state.counters.clone();
        let worker_span = tracing::Span::current();
        let worker = tokio::task::spawn_blocking(move || {
            let _entered = worker_span.enter();
            consume(pipeline, rx, &worker_cancel, &worker_log, &worker_counters);
        });

        let mut timed_out = false;
        let engine_error = match tokio::time::timeout_at(deadline, &mut engine_task).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e),
            Ok(Err(join_error)) => Some(EngineError::Task(join_error.to_string())),
            Err(_) => {
                timed_out = true;
                cancel.cancel();
                engine_task.abort();
                None
            }
        };

        let worker_result = if timed_out {
            worker.await
        } else {
            let mut worker = worker;
            match tokio::time::timeout_at(deadline, &mut worker).await {
                Ok(result) => result,
                Err(_) => {
                    timed_out = true;
                    cancel.cancel();
                    worker.await
                }
            }
        };
        let worker_failure = worker_result.err().map(|e| e.to_string());

        let status = if timed_out {
            ExecutionStatus::TimedOut
        } else if engine_error.is_some() || worker_failure.is_some() {
            ExecutionStatus::Errored
        } else {
            ExecutionStatus::Completed
        };

        if timed_out {
            state
                .log
                .error(format!("Run exceeded the {:?} timeout and was cancelled", self.run_timeout));
        }
        if let Some(e) = &engine_error {
            state.log.error(format!("Engine failed: {e}"));
        }
        if let Some(reason) = &worker_failure {
            state.log.error(format!("Record worker crashed: {reason}"));
        }

        let (execution, health) = self.finalize(&job, execution, &state, status).await?;

        if timed_out {
            return Err(ExecutionError::TimedOut {
                job: job.name,
                timeout: self.run_timeout,
                execution: Box::new(execution),
            });
        }
        if let Some(error) = engine_error {
            return Err(ExecutionError::Engine {
                job: job.name,
                execution: Box::new(execution),
                error,
            });
        }
        if let Some(reason) = worker_failure {
            return Err(ExecutionError::Worker {
                job: job.name,
                execution: Box::new(execution),
                reason,
            });
        }

        // The fault flag may have just been set
        let job_id = job.id;
        let job = self.db.call(move |conn| jobs::get_job(conn, job_id)).await?.unwrap_or(job);
        Ok(ExecutionSummary { job, execution, health })
    }

    /// Writes the terminal state and, for completed runs, scores health in the same
    /// transaction.
    async fn finalize(
        &self,
        job: &Job,
        mut execution: Execution,
        state: &RunState,
        status: ExecutionStatus,
    ) -> Result<(Execution, Option<HealthReport>), ScraperError> {
        let counters = state.counters();
        let mut crawl = state.stats.snapshot();
        crawl.elapsed_seconds = state.started.elapsed().as_secs_f64();
        crawl.finish_reason = match status {
            ExecutionStatus::TimedOut => Some(FINISH_TIMEOUT.to_string()),
            ExecutionStatus::Errored => Some(FINISH_ERROR.to_string()),
            _ => crawl.finish_reason.or_else(|| Some(FINISH_FINISHED.to_string())),
        };

        state.log.info(format!(
            "Run {}: {} seen, {} saved, {} invalid, {} duplicates, {} failed",
            status, counters.seen, counters.saved, counters.invalid, counters.duplicates, counters.failed
        ));

        execution.status = status;
        execution.ended_at = Some(Utc::now());
        execution.items_scraped = Some(counters.saved as i64);
        execution.stats = ExecutionStats {
            crawl,
            pipeline: counters,
        };
        execution.log = state.log.transcript();

        let monitor = self.health.clone();
        let scored_job = job.clone();
        let record = execution.clone();
        let health = self
            .db
            .call_in_transaction(move |conn| {
                jobs::finalize_execution(conn, &record)?;
                if status == ExecutionStatus::Completed {
                    monitor.evaluate(conn, &scored_job, &record).map(Some)
                } else {
                    Ok(None)
                }
            })
            .await?;

        metrics::record_run(
            &job.name,
            status.as_str(),
            state.started.elapsed(),
            execution.stats.pipeline.saved,
        );
        match status {
            ExecutionStatus::Completed => info!(
                items_scraped = execution.stats.pipeline.saved,
                health = ?health.as_ref().map(|h| h.status),
                "Run completed"
            ),
            ExecutionStatus::TimedOut => warn!(items_scraped = execution.stats.pipeline.saved, "Run timed out"),
            _ => error!(items_scraped = execution.stats.pipeline.saved, "Run errored"),
        }

        Ok((execution, health))
    }
}

/// Drains the channel through the pipeline, one record at a time, until the engine
/// hangs up or the run is cancelled.
fn consume(
    mut pipeline: Pipeline,
    mut rx: mpsc::Receiver<RawRecord>,
    cancel: &CancellationToken,
    log: &CrawlLog,
    counters: &Mutex<PipelineCounters>,
) {
    while let Some(record) = rx.blocking_recv() {
        if cancel.is_cancelled() {
            log.warning("Run cancelled; discarding remaining records");
            break;
        }
        let key = record.log_key();
        match pipeline.process(record) {
            Outcome::Saved(saved) => log.debug(format!("Saved {}", saved.key)),
            Outcome::Dropped(DropReason::Invalid(err)) => log.warning(format!("Dropped invalid {key}: {err}")),
            Outcome::Dropped(DropReason::Duplicate(dup)) => log.info(format!("Dropped duplicate {dup}")),
            Outcome::Failed(err) => log.error(format!("Failed {key}: {err}")),
        }
        *counters.lock().unwrap_or_else(PoisonError::into_inner) = pipeline.counters().clone();
    }
}
