use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use catalog_scraper::constants::DEFAULT_CONFIG_PATH;
use catalog_scraper::engine::EngineRegistry;
use catalog_scraper::executor::ExecutionSummary;
use catalog_scraper::storage::{jobs, CatalogDb};
use catalog_scraper::{logging, metrics, scheduler, Config, ExecutionError, Executor};

#[derive(Parser)]
#[command(name = "catalog_scraper")]
#[command(about = "Runs catalog crawl jobs and tracks their health")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import the [[jobs]] entries of the configuration into the store
    SyncJobs,
    /// Run one job now
    Run {
        #[arg(long)]
        job: String,
    },
    /// Run every active job once
    RunActive,
    /// Run every active job repeatedly until interrupted
    Schedule {
        #[arg(long, default_value_t = 3600)]
        interval_secs: u64,
    },
    /// List jobs with their fault flags
    Jobs,
    /// Show recent executions of a job
    History {
        #[arg(long)]
        job: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Clear a job's fault flag after the cause has been fixed
    ResetFault {
        #[arg(long)]
        job: String,
    },
}

fn print_summary(summary: &ExecutionSummary) {
    let execution = &summary.execution;
    println!("✅ {} finished", summary.job.name);
    println!("   Items scraped: {}", execution.items_scraped.unwrap_or(0));
    println!("   Responses: {}", execution.responses());
    println!("   Downloaded: {}", execution.download_size());
    println!("   Duration: {}s", execution.seconds());
    println!("   Finish reason: {}", execution.finish_reason());
    if let Some(health) = &summary.health {
        println!("   Health: {} ({})", health.status, health.message);
    }
    if summary.job.fault {
        println!("   ⚠️  Job is flagged as faulty");
    }
}

fn print_failure(job: &str, err: &ExecutionError) {
    println!("❌ {job}: {err}");
    if let Some(execution) = err.execution() {
        println!(
            "   Execution {} finalized as {} with {} items",
            execution.id,
            execution.status,
            execution.items_scraped.unwrap_or(0)
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(&cli.config).context("loading configuration")?;
    let _log_guard = logging::init_logging(&config.logging).context("initializing logging")?;
    metrics::init_metrics(config.metrics_addr);

    let db = CatalogDb::open(&config.database.path).context("opening catalog database")?;
    let imported = db.with_conn(|conn| jobs::import_jobs(conn, &config.jobs))?;

    match cli.command {
        Commands::SyncJobs => {
            println!("🔄 Imported {} job definitions", imported.len());
            for job in &imported {
                println!("   {} ({}){}", job.name, job.module, if job.active { "" } else { " [inactive]" });
            }
        }
        Commands::Run { job } => {
            let executor = Executor::new(db, EngineRegistry::with_builtin(), &config);
            match executor.execute_by_name(&job).await {
                Ok(summary) => print_summary(&summary),
                Err(e) => {
                    print_failure(&job, &e);
                    return Err(e.into());
                }
            }
        }
        Commands::RunActive => {
            let executor = Executor::new(db, EngineRegistry::with_builtin(), &config);
            let reports = scheduler::run_active(&executor, config.executor.max_parallel_jobs).await?;
            let mut failures = 0;
            for report in &reports {
                match &report.outcome {
                    Ok(summary) => print_summary(summary),
                    Err(e) => {
                        failures += 1;
                        print_failure(&report.job, e);
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} of {} jobs did not complete", reports.len());
            }
        }
        Commands::Schedule { interval_secs } => {
            if interval_secs == 0 {
                bail!("--interval-secs must be positive");
            }
            let executor = Executor::new(db, EngineRegistry::with_builtin(), &config);
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Interrupt received"),
                    Err(e) => error!("Failed to listen for interrupt: {}", e),
                }
                signal.cancel();
            });
            println!("⏱️  Running active jobs every {interval_secs}s (Ctrl-C to stop)");
            scheduler::run_periodic(
                &executor,
                config.executor.max_parallel_jobs,
                Duration::from_secs(interval_secs),
                shutdown,
            )
            .await?;
        }
        Commands::Jobs => {
            let all = db.with_conn(jobs::list_jobs)?;
            for job in all {
                let state = match (job.active, job.fault) {
                    (_, true) => "FAULTY",
                    (true, false) => "active",
                    (false, false) => "inactive",
                };
                println!("{:<30} {:<12} {:<8} {}", job.name, job.module, state, job.log_level.as_str());
            }
        }
        Commands::History { job, limit } => {
            let found = db
                .with_conn(|conn| jobs::get_job_by_name(conn, &job))?
                .with_context(|| format!("job '{job}' not found"))?;
            let executions = db.with_conn(|conn| jobs::list_executions(conn, found.id, limit))?;
            for execution in executions {
                println!(
                    "{}  {:<10} items={:<6} responses={:<5} size={:<10} {}s  {}",
                    execution.started_at.format("%Y-%m-%d %H:%M:%S"),
                    execution.status.as_str(),
                    execution.items_scraped.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string()),
                    execution.responses(),
                    execution.download_size(),
                    execution.seconds(),
                    execution.finish_reason()
                );
            }
        }
        Commands::ResetFault { job } => {
            let found = db
                .with_conn(|conn| jobs::get_job_by_name(conn, &job))?
                .with_context(|| format!("job '{job}' not found"))?;
            db.with_conn(|conn| jobs::set_fault(conn, found.id, false))?;
            info!(job = %found.name, "Fault flag cleared by operator");
            println!("✅ Cleared fault flag on {}", found.name);
        }
    }
    Ok(())
}
