use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{CrawlContext, CrawlEngine, EngineError, RecordSink};
use crate::constants::FEED_FILE_ENGINE;
use crate::types::RawRecord;

/// Replays a JSON Lines feed: one `{"kind": ..., "fields": {...}}` record per line.
///
/// Settings: `path` (required) and `delay_ms`, a pause between records.
/// Malformed lines are logged to the transcript and skipped.
pub struct FeedFileEngine;

#[async_trait]
impl CrawlEngine for FeedFileEngine {
    fn name(&self) -> &str {
        FEED_FILE_ENGINE
    }

    fn default_settings(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("delay_ms".to_string(), json!(0));
        defaults
    }

    async fn crawl(&self, ctx: CrawlContext, sink: RecordSink) -> Result<(), EngineError> {
        let path = ctx
            .setting_str("path")
            .ok_or_else(|| EngineError::Settings("feed_file requires a 'path' setting".to_string()))?
            .to_string();
        let delay = Duration::from_millis(ctx.setting_u64("delay_ms")?.unwrap_or(0));

        ctx.log.info(format!("Reading feed {path}"));
        ctx.stats.record_request();
        let file = File::open(&path).await?;
        let mut lines = BufReader::new(file).lines();

        let mut line_no = 0u64;
        let mut bytes = 0u64;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            bytes += line.len() as u64 + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawRecord>(line) {
                Ok(record) => {
                    sink.emit(record).await?;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => ctx.log.warning(format!("Skipping line {line_no} of {path}: {e}")),
            }
        }

        ctx.stats.record_response(bytes);
        ctx.log.info(format!("Finished feed {path} after {line_no} lines"));
        Ok(())
    }
}
