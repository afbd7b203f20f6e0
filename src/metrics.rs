use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

pub const RECORDS_TOTAL: &str = "catalog_records_total";
pub const RUNS_TOTAL: &str = "catalog_runs_total";
pub const RUN_DURATION_SECONDS: &str = "catalog_run_duration_seconds";
pub const RUN_ITEMS_SCRAPED: &str = "catalog_run_items_scraped";

/// Installs the Prometheus exporter when an address is configured. Without a
/// recorder the metric macros are no-ops.
pub fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else {
        return;
    };
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => info!(%addr, "Prometheus exporter listening on http://{}/metrics", addr),
        Err(e) => warn!(%addr, "Prometheus exporter install failed: {}", e),
    }
}

/// Counts one pipeline outcome: saved, invalid, duplicate or failed.
pub fn record_outcome(outcome: &'static str) {
    ::metrics::counter!(RECORDS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_run(job: &str, status: &'static str, duration: Duration, items_scraped: u64) {
    ::metrics::counter!(RUNS_TOTAL, "status" => status).increment(1);
    ::metrics::histogram!(RUN_DURATION_SECONDS, "job" => job.to_string()).record(duration.as_secs_f64());
    ::metrics::gauge!(RUN_ITEMS_SCRAPED, "job" => job.to_string()).set(items_scraped as f64);
}
