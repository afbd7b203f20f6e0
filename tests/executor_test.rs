mod common;

use anyhow::Result;
use catalog_scraper::config::JobDefinition;
use catalog_scraper::constants::{FINISH_ERROR, FINISH_FINISHED, FINISH_TIMEOUT};
use catalog_scraper::domain::{ExecutionStatus, LogLevel};
use catalog_scraper::engine::{CrawlEngine, EngineError, EngineRegistry};
use catalog_scraper::health::HealthStatus;
use catalog_scraper::scheduler;
use catalog_scraper::storage::{catalog, jobs, CatalogDb};
use catalog_scraper::{ExecutionError, Executor};
use common::*;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

fn executor_with(engines: Vec<Arc<dyn CrawlEngine>>) -> Result<(CatalogDb, Executor)> {
    let db = CatalogDb::open_in_memory()?;
    let mut registry = EngineRegistry::new();
    for engine in engines {
        registry.register(engine);
    }
    let executor = Executor::new(db.clone(), registry, &test_config());
    Ok((db, executor))
}

#[tokio::test]
async fn test_completed_run_is_finalized_with_counts() -> Result<()> {
    let records = vec![
        resource("mooc", "a"),
        resource("mooc", "a"),
        invalid_resource("mooc", "bad"),
        resource("mooc", "b"),
    ];
    let (db, executor) = executor_with(vec![Arc::new(ListEngine { name: "list", records })])?;
    let job = create_job(&db, "list-job", "list");

    let summary = executor.execute(job.id).await?;
    let execution = &summary.execution;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.ended_at.is_some());
    assert_eq!(execution.items_scraped, Some(2));
    assert_eq!(execution.stats.pipeline.seen, 4);
    assert_eq!(execution.stats.pipeline.duplicates, 1);
    assert_eq!(execution.stats.pipeline.invalid, 1);
    assert_eq!(execution.stats.crawl.records_emitted, 4);
    assert_eq!(execution.stats.crawl.response_bytes, 2048);
    assert_eq!(execution.finish_reason(), FINISH_FINISHED);
    assert!(execution.log.contains("Dropped duplicate"));
    assert!(execution.log.contains("Dropped invalid"));

    let health = summary.health.as_ref().expect("completed runs are scored");
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(!summary.job.fault);

    let stored = db
        .with_conn(|conn| jobs::get_execution(conn, execution.id))?
        .expect("execution stored");
    assert!(stored.is_finalized());
    assert_eq!(stored.items_scraped, Some(2));
    assert_eq!(catalog::count_resources(&db.lock())?, 2);
    assert!(!executor.is_running(job.id));
    Ok(())
}

#[tokio::test]
async fn test_timed_out_run_keeps_partial_results() -> Result<()> {
    let engine = StallingEngine {
        records: resources("slowpoke", "item", 2),
    };
    let (db, executor) = executor_with(vec![Arc::new(engine)])?;
    let executor = executor.with_run_timeout(Duration::from_millis(500));
    let job = create_job(&db, "stalling-job", "stalling");

    let err = executor.execute(job.id).await.expect_err("run should time out");
    assert!(matches!(err, ExecutionError::TimedOut { .. }), "got {err:?}");
    let execution = err.execution().expect("finalized execution attached");
    assert_eq!(execution.status, ExecutionStatus::TimedOut);
    assert_eq!(execution.items_scraped, Some(2));
    assert_eq!(execution.finish_reason(), FINISH_TIMEOUT);

    let stored = db
        .with_conn(|conn| jobs::get_execution(conn, execution.id))?
        .expect("execution stored");
    assert_eq!(stored.status, ExecutionStatus::TimedOut);
    assert!(stored.ended_at.is_some());
    assert_eq!(stored.items_scraped, Some(2));
    assert!(stored.log.contains("timeout"));
    assert!(!executor.is_running(job.id));

    // Timed-out runs are not scored
    let job = db.with_conn(|conn| jobs::get_job(conn, job.id))?.expect("job exists");
    assert!(!job.fault);
    Ok(())
}

#[tokio::test]
async fn test_engine_failure_finalizes_as_errored() -> Result<()> {
    let engine = FailingEngine {
        records: vec![resource("flaky", "one")],
    };
    let (db, executor) = executor_with(vec![Arc::new(engine)])?;
    let job = create_job(&db, "failing-job", "failing");

    let err = executor.execute(job.id).await.expect_err("engine failure surfaces");
    match &err {
        ExecutionError::Engine { error, .. } => assert!(matches!(error, EngineError::Feed(_))),
        other => panic!("expected engine error, got {other:?}"),
    }
    let execution = err.execution().expect("finalized execution attached");
    assert_eq!(execution.status, ExecutionStatus::Errored);
    assert!(execution.ended_at.is_some());
    assert_eq!(execution.finish_reason(), FINISH_ERROR);
    // Records already emitted are still processed
    assert_eq!(execution.items_scraped, Some(1));
    assert!(execution.log.contains("upstream returned garbage"));

    let job = db.with_conn(|conn| jobs::get_job(conn, job.id))?.expect("job exists");
    assert!(!job.fault);
    Ok(())
}

#[tokio::test]
async fn test_unknown_module_finalizes_as_errored() -> Result<()> {
    let (db, executor) = executor_with(Vec::new())?;
    let job = create_job(&db, "orphan", "no_such_engine");

    let err = executor.execute(job.id).await.expect_err("module cannot be resolved");
    match &err {
        ExecutionError::Engine { error, .. } => assert!(matches!(error, EngineError::UnknownModule(m) if m == "no_such_engine")),
        other => panic!("expected engine error, got {other:?}"),
    }

    let history = db.with_conn(|conn| jobs::list_executions(conn, job.id, 10))?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Errored);
    assert!(history[0].ended_at.is_some());
    Ok(())
}

#[tokio::test]
async fn test_missing_job_is_rejected() -> Result<()> {
    let (_db, executor) = executor_with(Vec::new())?;
    let err = executor.execute(Uuid::new_v4()).await.expect_err("no such job");
    assert!(matches!(err, ExecutionError::JobNotFound(_)));

    let err = executor.execute_by_name("ghost").await.expect_err("no such job");
    assert!(matches!(err, ExecutionError::JobNotFound(name) if name == "ghost"));
    Ok(())
}

#[tokio::test]
async fn test_second_run_of_same_job_is_rejected() -> Result<()> {
    let gate = Arc::new(Notify::new());
    let (db, executor) = executor_with(vec![Arc::new(GatedEngine { gate: gate.clone() })])?;
    let job = create_job(&db, "gated-job", "gated");

    let first = tokio::spawn({
        let executor = executor.clone();
        let job_id = job.id;
        async move { executor.execute(job_id).await }
    });

    for _ in 0..200 {
        if executor.is_running(job.id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(executor.is_running(job.id));

    let err = executor.execute(job.id).await.expect_err("single flight");
    assert!(matches!(err, ExecutionError::AlreadyRunning(name) if name == "gated-job"));

    gate.notify_one();
    let summary = first.await??;
    assert_eq!(summary.execution.status, ExecutionStatus::Completed);
    assert_eq!(summary.execution.items_scraped, Some(1));
    assert!(!executor.is_running(job.id));

    // Only the accepted run was recorded
    let history = db.with_conn(|conn| jobs::list_executions(conn, job.id, 10))?;
    assert_eq!(history.len(), 1);
    Ok(())
}

fn executor_on(db: &CatalogDb, engine: Arc<dyn CrawlEngine>) -> Executor {
    let mut registry = EngineRegistry::new();
    registry.register(engine);
    Executor::new(db.clone(), registry, &test_config())
}

#[tokio::test]
async fn test_run_in_another_process_blocks_the_job() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("catalog.db");
    let gate = Arc::new(Notify::new());
    let first_db = CatalogDb::open(&path)?;
    let second_db = CatalogDb::open(&path)?;
    let first = executor_on(&first_db, Arc::new(GatedEngine { gate: gate.clone() }));
    let second = executor_on(&second_db, Arc::new(GatedEngine { gate: gate.clone() }));
    let job = create_job(&first_db, "shared-job", "gated");

    let running = tokio::spawn({
        let job_id = job.id;
        async move { first.execute(job_id).await }
    });
    for _ in 0..200 {
        let history = second_db.with_conn(|conn| jobs::list_executions(conn, job.id, 10))?;
        if history.iter().any(|e| e.status == ExecutionStatus::Running) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(!second.is_running(job.id));
    let err = second.execute(job.id).await.expect_err("job is held by the other executor");
    assert!(matches!(err, ExecutionError::AlreadyRunning(name) if name == "shared-job"));

    gate.notify_one();
    let summary = running.await??;
    assert_eq!(summary.execution.status, ExecutionStatus::Completed);
    let history = second_db.with_conn(|conn| jobs::list_executions(conn, job.id, 10))?;
    assert_eq!(history.len(), 1);

    // Free again once the run is finalized
    gate.notify_one();
    let summary = second.execute(job.id).await?;
    assert_eq!(summary.execution.status, ExecutionStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn test_abandoned_execution_does_not_block_the_job() -> Result<()> {
    let records = vec![resource("mooc", "a")];
    let (db, executor) = executor_with(vec![Arc::new(ListEngine { name: "list", records })])?;
    let job = create_job(&db, "crashed-job", "list");
    let abandoned = db.with_conn(|conn| {
        let execution = jobs::create_execution(conn, job.id, chrono::Utc::now() - chrono::Duration::hours(2))?;
        jobs::mark_running(conn, execution.id)?;
        Ok(execution)
    })?;

    let summary = executor.execute(job.id).await?;
    assert_eq!(summary.execution.status, ExecutionStatus::Completed);

    let abandoned = db
        .with_conn(|conn| jobs::get_execution(conn, abandoned.id))?
        .expect("execution stored");
    assert_eq!(abandoned.status, ExecutionStatus::Errored);
    assert!(abandoned.ended_at.is_some());
    Ok(())
}

#[tokio::test]
async fn test_unfinished_execution_within_timeout_blocks_the_job() -> Result<()> {
    let (db, executor) = executor_with(vec![Arc::new(ListEngine { name: "list", records: vec![] })])?;
    let job = create_job(&db, "busy-job", "list");
    db.with_conn(|conn| jobs::create_execution(conn, job.id, chrono::Utc::now() - chrono::Duration::minutes(5)))?;

    let err = executor.execute(job.id).await.expect_err("recent run still holds the job");
    assert!(matches!(err, ExecutionError::AlreadyRunning(_)));
    Ok(())
}

#[tokio::test]
async fn test_unrepresentable_timeout_is_rejected_before_the_run() -> Result<()> {
    let (db, executor) = executor_with(vec![Arc::new(ListEngine { name: "list", records: vec![] })])?;
    let executor = executor.with_run_timeout(Duration::MAX);
    let job = create_job(&db, "forever-job", "list");

    let err = executor.execute(job.id).await.expect_err("timeout overflows the clock");
    assert!(matches!(
        err,
        ExecutionError::Storage(catalog_scraper::error::ScraperError::Config(_))
    ));
    assert!(!executor.is_running(job.id));
    let history = db.with_conn(|conn| jobs::list_executions(conn, job.id, 10))?;
    assert!(history.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_store_contention_does_not_stall_the_runtime() -> Result<()> {
    let records = vec![resource("mooc", "a")];
    let (db, executor) = executor_with(vec![Arc::new(ListEngine { name: "list", records })])?;
    let job = create_job(&db, "contended-job", "list");

    let held = db.clone();
    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let holder = std::thread::spawn(move || {
        let _conn = held.lock();
        let _ = locked_tx.send(());
        std::thread::sleep(Duration::from_millis(400));
    });
    locked_rx.recv()?;

    let run = tokio::spawn({
        let job_id = job.id;
        async move { executor.execute(job_id).await }
    });
    let started = std::time::Instant::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    // The runtime kept ticking while the run waited on the connection
    assert!(started.elapsed() < Duration::from_millis(300));

    holder.join().expect("lock holder thread");
    let summary = run.await??;
    assert_eq!(summary.execution.status, ExecutionStatus::Completed);
    assert_eq!(summary.execution.items_scraped, Some(1));
    Ok(())
}

#[tokio::test]
async fn test_yield_drop_marks_job_faulty() -> Result<()> {
    let engine = ListEngine {
        name: "list",
        records: resources("shrinking", "page", 30),
    };
    let (db, executor) = executor_with(vec![Arc::new(engine)])?;
    let job = create_job(&db, "shrinking-job", "list");
    seed_history(
        &db,
        &job,
        &[
            (ExecutionStatus::Completed, 100),
            (ExecutionStatus::Completed, 100),
            (ExecutionStatus::Completed, 100),
        ],
    );

    let summary = executor.execute(job.id).await?;
    assert_eq!(summary.execution.items_scraped, Some(30));
    let health = summary.health.expect("completed runs are scored");
    assert_eq!(health.status, HealthStatus::Faulty);
    assert_eq!(health.average, Some(100.0));
    assert!(summary.job.fault);
    Ok(())
}

#[tokio::test]
async fn test_empty_run_marks_job_faulty() -> Result<()> {
    let engine = ListEngine {
        name: "empty",
        records: Vec::new(),
    };
    let (db, executor) = executor_with(vec![Arc::new(engine)])?;
    let job = create_job(&db, "empty-job", "empty");

    let summary = executor.execute(job.id).await?;
    assert_eq!(summary.execution.status, ExecutionStatus::Completed);
    assert_eq!(summary.execution.items_scraped, Some(0));
    assert_eq!(summary.health.map(|h| h.status), Some(HealthStatus::Faulty));
    assert!(summary.job.fault);
    Ok(())
}

#[tokio::test]
async fn test_feed_file_job_end_to_end() -> Result<()> {
    let mut feed = tempfile::NamedTempFile::new()?;
    writeln!(
        feed,
        r#"{{"kind": "contributor", "fields": {{"source": "openlearn", "local_id": "ou", "name": "The Open University"}}}}"#
    )?;
    writeln!(
        feed,
        r#"{{"kind": "resource", "fields": {{"source": "openlearn", "local_id": "intro", "name": "Intro &amp; Basics", "description": "<p>Start here</p>", "url": "https://example.org/intro", "is_free": "yes", "languages": ["English"], "contributors": [{{"local_id": "ou", "name": "The Open University"}}]}}}}"#
    )?;
    writeln!(feed, "this line is not json")?;
    writeln!(
        feed,
        r#"{{"kind": "resource", "fields": {{"source": "openlearn", "local_id": "nameless", "description": "x", "url": "https://example.org/x", "is_free": true, "languages": ["en"]}}}}"#
    )?;
    feed.flush()?;

    let db = CatalogDb::open_in_memory()?;
    let executor = Executor::new(db.clone(), EngineRegistry::with_builtin(), &test_config());
    let mut settings = serde_json::Map::new();
    settings.insert("path".to_string(), json!(feed.path().to_string_lossy()));
    let job = create_job_with_settings(&db, "openlearn", "feed_file", settings);

    let summary = executor.execute_by_name("openlearn").await?;
    let execution = &summary.execution;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.items_scraped, Some(2));
    assert_eq!(execution.stats.pipeline.invalid, 1);
    assert_eq!(execution.stats.crawl.request_count, 1);
    assert!(execution.stats.crawl.response_bytes > 0);
    assert!(execution.log.contains("Skipping line 3"));

    let conn = db.lock();
    let intro = catalog::find_resource(&conn, "openlearn", "intro")?.expect("resource stored");
    assert_eq!(intro.name, "Intro & Basics");
    assert_eq!(intro.description, "Start here");
    assert_eq!(intro.language_codes, vec!["en"]);
    let ou = catalog::find_contributor(&conn, "openlearn", "ou")?.expect("contributor stored");
    assert_eq!(intro.contributor_ids, vec![ou.id]);
    assert!(catalog::find_resource(&conn, "openlearn", "nameless")?.is_none());
    drop(conn);

    assert_eq!(summary.job.id, job.id);
    Ok(())
}

#[tokio::test]
async fn test_run_active_reports_each_job() -> Result<()> {
    let engine = ListEngine {
        name: "list",
        records: resources("batch", "r", 3),
    };
    let (db, executor) = executor_with(vec![Arc::new(engine)])?;
    create_job(&db, "b-good", "list");
    create_job(&db, "a-broken", "missing_module");
    let paused = JobDefinition {
        name: "c-paused".to_string(),
        module: "list".to_string(),
        active: false,
        log_level: LogLevel::Info,
        settings: serde_json::Map::new(),
    };
    let paused = db.with_conn(|conn| jobs::import_jobs(conn, &[paused]))?.remove(0);

    let reports = scheduler::run_active(&executor, 2).await?;
    let names: Vec<&str> = reports.iter().map(|r| r.job.as_str()).collect();
    assert_eq!(names, vec!["a-broken", "b-good"]);
    assert!(reports[0].outcome.is_err());
    let good = reports[1].outcome.as_ref().expect("good job completes");
    assert_eq!(good.execution.items_scraped, Some(3));

    let paused_history = db.with_conn(|conn| jobs::list_executions(conn, paused.id, 10))?;
    assert!(paused_history.is_empty());
    Ok(())
}
