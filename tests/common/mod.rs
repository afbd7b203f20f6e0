#![allow(dead_code)]

use async_trait::async_trait;
use catalog_scraper::config::{Config, JobDefinition};
use catalog_scraper::domain::{ExecutionStatus, Job, LogLevel};
use catalog_scraper::engine::{CrawlContext, CrawlEngine, EngineError, RecordSink};
use catalog_scraper::storage::{jobs, CatalogDb};
use catalog_scraper::types::RawRecord;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub fn resource(source: &str, local_id: &str) -> RawRecord {
    serde_json::from_value(json!({
        "kind": "resource",
        "fields": {
            "source": source,
            "local_id": local_id,
            "name": format!("Course {local_id}"),
            "description": "An <em>introductory</em> course",
            "url": format!("https://example.com/courses/{local_id}"),
            "is_free": true,
            "languages": ["English"],
            "tags": ["Programming"]
        }
    }))
    .expect("valid test record")
}

pub fn invalid_resource(source: &str, local_id: &str) -> RawRecord {
    serde_json::from_value(json!({
        "kind": "resource",
        "fields": {
            "source": source,
            "local_id": local_id,
            "url": "https://example.com/x",
            "is_free": true,
            "languages": ["en"]
        }
    }))
    .expect("valid test record")
}

pub fn resources(source: &str, prefix: &str, count: usize) -> Vec<RawRecord> {
    (0..count).map(|i| resource(source, &format!("{prefix}-{i}"))).collect()
}

pub fn create_job(db: &CatalogDb, name: &str, module: &str) -> Job {
    create_job_with_settings(db, name, module, serde_json::Map::new())
}

pub fn create_job_with_settings(
    db: &CatalogDb,
    name: &str,
    module: &str,
    settings: serde_json::Map<String, serde_json::Value>,
) -> Job {
    let definition = JobDefinition {
        name: name.to_string(),
        module: module.to_string(),
        active: true,
        log_level: LogLevel::Debug,
        settings,
    };
    db.with_conn(|conn| jobs::import_jobs(conn, &[definition]))
        .expect("import job")
        .remove(0)
}

/// Seeds finalized history, oldest first, ending `len` minutes ago.
pub fn seed_history(db: &CatalogDb, job: &Job, items: &[(ExecutionStatus, i64)]) {
    let len = items.len() as i64;
    for (idx, (status, count)) in items.iter().enumerate() {
        let started = Utc::now() - ChronoDuration::minutes(len - idx as i64 + 1);
        db.with_conn(|conn| {
            let mut execution = jobs::create_execution(conn, job.id, started)?;
            execution.status = *status;
            execution.ended_at = Some(started + ChronoDuration::seconds(30));
            execution.items_scraped = Some(*count);
            jobs::finalize_execution(conn, &execution)
        })
        .expect("seed execution");
    }
}

pub fn test_config() -> Config {
    Config::default()
}

/// Emits a fixed list of records, then finishes.
pub struct ListEngine {
    pub name: &'static str,
    pub records: Vec<RawRecord>,
}

#[async_trait]
impl CrawlEngine for ListEngine {
    fn name(&self) -> &str {
        self.name
    }

    async fn crawl(&self, ctx: CrawlContext, sink: RecordSink) -> Result<(), EngineError> {
        ctx.stats.record_request();
        ctx.stats.record_response(2048);
        for record in &self.records {
            sink.emit(record.clone()).await?;
        }
        Ok(())
    }
}

/// Emits its records, then hangs far longer than any test timeout.
pub struct StallingEngine {
    pub records: Vec<RawRecord>,
}

#[async_trait]
impl CrawlEngine for StallingEngine {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn crawl(&self, ctx: CrawlContext, sink: RecordSink) -> Result<(), EngineError> {
        for record in &self.records {
            sink.emit(record.clone()).await?;
        }
        ctx.log.info("waiting on a slow upstream");
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Emits its records, then fails.
pub struct FailingEngine {
    pub records: Vec<RawRecord>,
}

#[async_trait]
impl CrawlEngine for FailingEngine {
    fn name(&self) -> &str {
        "failing"
    }

    async fn crawl(&self, _ctx: CrawlContext, sink: RecordSink) -> Result<(), EngineError> {
        for record in &self.records {
            sink.emit(record.clone()).await?;
        }
        Err(EngineError::Feed("upstream returned garbage".to_string()))
    }
}

/// Blocks until released, then emits one record.
pub struct GatedEngine {
    pub gate: Arc<Notify>,
}

#[async_trait]
impl CrawlEngine for GatedEngine {
    fn name(&self) -> &str {
        "gated"
    }

    async fn crawl(&self, _ctx: CrawlContext, sink: RecordSink) -> Result<(), EngineError> {
        self.gate.notified().await;
        sink.emit(resource("gated-source", "only")).await
    }
}
