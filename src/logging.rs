use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::Result;

/// Installs console and daily-rolling JSON file logging.
///
/// `RUST_LOG` wins over the configured default filter. Keep the returned guard
/// alive for the life of the process so buffered file logs are flushed on exit.
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    fs::create_dir_all(&config.directory)?;

    let file_appender = tracing_appender::rolling::daily(&config.directory, &config.file_name);
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer().with_writer(std::io::stdout);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(guard)
}
