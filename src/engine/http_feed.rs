use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::task::JoinSet;

use super::rate_limiter::{Limits, RateLimiter};
use super::{CrawlContext, CrawlEngine, EngineError, RecordSink};
use crate::constants::HTTP_FEED_ENGINE;
use crate::types::RawRecord;

/// Fetches JSON record pages over HTTP.
///
/// A page is either an array of records or an object with a `records` array and an
/// optional `next` URL that is queued for fetching.
pub struct HttpFeedEngine {
    client: reqwest::Client,
}

impl HttpFeedEngine {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFeedEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct FeedPage {
    pub records: Vec<RawRecord>,
    pub next: Option<String>,
    /// Entries that did not deserialize, with the reason
    pub rejected: Vec<String>,
}

/// Splits a page body into records, collecting per-record decode failures.
pub fn parse_page(body: &[u8]) -> Result<FeedPage, EngineError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| EngineError::Feed(e.to_string()))?;
    let (entries, next) = match value {
        Value::Array(entries) => (entries, None),
        Value::Object(mut page) => {
            let entries = match page.remove("records") {
                Some(Value::Array(entries)) => entries,
                _ => return Err(EngineError::Feed("page object has no 'records' array".to_string())),
            };
            let next = page.remove("next").and_then(|v| v.as_str().map(str::to_string));
            (entries, next)
        }
        _ => return Err(EngineError::Feed("page is neither an array nor an object".to_string())),
    };

    let mut page = FeedPage {
        next,
        ..FeedPage::default()
    };
    for (idx, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<RawRecord>(entry) {
            Ok(record) => page.records.push(record),
            Err(e) => page.rejected.push(format!("entry {idx}: {e}")),
        }
    }
    Ok(page)
}

fn url_list(ctx: &CrawlContext) -> Result<Vec<String>, EngineError> {
    let urls = match ctx.settings.get("urls") {
        Some(Value::Array(urls)) => urls
            .iter()
            .map(|u| {
                u.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| EngineError::Settings("'urls' must contain strings".to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(Value::String(url)) => vec![url.clone()],
        _ => return Err(EngineError::Settings("http_feed requires a 'urls' setting".to_string())),
    };
    if urls.is_empty() {
        return Err(EngineError::Settings("'urls' is empty".to_string()));
    }
    Ok(urls)
}

async fn fetch_page(
    client: reqwest::Client,
    limiter: RateLimiter,
    url: String,
    timeout: Duration,
) -> Result<(String, u64, FeedPage), EngineError> {
    let _permit = limiter.acquire().await;
    let response = client.get(&url).timeout(timeout).send().await?.error_for_status()?;
    let body = response.bytes().await?;
    let page = parse_page(&body)?;
    Ok((url, body.len() as u64, page))
}

#[async_trait]
impl CrawlEngine for HttpFeedEngine {
    fn name(&self) -> &str {
        HTTP_FEED_ENGINE
    }

    fn default_settings(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("concurrency".to_string(), json!(2));
        defaults.insert("requests_per_minute".to_string(), json!(60));
        defaults.insert("timeout_secs".to_string(), json!(30));
        defaults.insert("max_pages".to_string(), json!(100));
        defaults
    }

    async fn crawl(&self, ctx: CrawlContext, sink: RecordSink) -> Result<(), EngineError> {
        let mut pending: VecDeque<String> = url_list(&ctx)?.into();
        let concurrency = ctx.setting_u64("concurrency")?.unwrap_or(2).max(1) as usize;
        let limiter = RateLimiter::new(Limits {
            requests_per_min: ctx.setting_u64("requests_per_minute")?,
            concurrency: Some(concurrency as u32),
        });
        let timeout = Duration::from_secs(ctx.setting_u64("timeout_secs")?.unwrap_or(30));
        let max_pages = ctx.setting_u64("max_pages")?.unwrap_or(100);

        let mut requested = 0u64;
        let mut tasks = JoinSet::new();
        loop {
            while tasks.len() < concurrency && requested < max_pages {
                let Some(url) = pending.pop_front() else {
                    break;
                };
                requested += 1;
                ctx.stats.record_request();
                ctx.log.debug(format!("Requesting {url}"));
                tasks.spawn(fetch_page(self.client.clone(), limiter.clone(), url, timeout));
            }

            let joined = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let (url, bytes, page) = joined.map_err(|e| EngineError::Task(e.to_string()))??;
            ctx.stats.record_response(bytes);
            ctx.log.info(format!("Fetched {url}: {} records ({bytes} bytes)", page.records.len()));
            for reason in &page.rejected {
                ctx.log.warning(format!("Skipping record from {url}: {reason}"));
            }
            for record in page.records {
                sink.emit(record).await?;
            }
            if let Some(next) = page.next {
                pending.push_back(next);
            }
        }

        if !pending.is_empty() {
            ctx.log.warning(format!("Stopped after {max_pages} pages with {} URLs left", pending.len()));
            ctx.stats.set_finish_reason("page_limit");
        }
        Ok(())
    }
}
