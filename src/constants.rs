/// Engine module names, as referenced by a job's `module`
pub const FEED_FILE_ENGINE: &str = "feed_file";
pub const HTTP_FEED_ENGINE: &str = "http_feed";

// Defaults for the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_DB_PATH: &str = "data/catalog.db";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_LOG_FILE: &str = "catalog_scraper.log";
pub const DEFAULT_LOG_FILTER: &str = "catalog_scraper=info";
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 3600;
pub const MAX_RUN_TIMEOUT_SECS: u64 = 7 * 24 * 3600;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;
pub const DEFAULT_MAX_PARALLEL_JOBS: usize = 3;

// Environment overrides, applied after the config file
pub const ENV_DB_PATH: &str = "CATALOG_DB_PATH";
pub const ENV_RUN_TIMEOUT_SECS: &str = "CATALOG_RUN_TIMEOUT_SECS";
pub const ENV_METRICS_ADDR: &str = "CATALOG_METRICS_ADDR";

// Finish reasons recorded on executions
pub const FINISH_FINISHED: &str = "finished";
pub const FINISH_TIMEOUT: &str = "timeout";
pub const FINISH_ERROR: &str = "error";
