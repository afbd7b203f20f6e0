pub mod config;
pub mod constants;
pub mod domain;
pub mod engine;
pub mod error;
pub mod executor;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use config::Config;
pub use error::{Result, ScraperError};
pub use executor::{ExecutionError, ExecutionSummary, Executor};
