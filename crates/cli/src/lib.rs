//! `etl-daily`: run one idempotent daily job against Postgres.
//!
//! This crate is the composition root. It owns the breaker registry, builds
//! the Postgres adapters and hands them to a [`JobRunner`].

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info};

use finpulse_core::LogicalDate;
use finpulse_infra::db::{self, DbConfig};
use finpulse_infra::jobs::{
    JobOutcome, JobRunner, JobRunnerConfig, PostgresWorkUnitSource, RunRequest, SqlUnitPipeline,
};
use finpulse_infra::runs::{DEFAULT_STALE_THRESHOLD, PostgresRunStore};
use finpulse_resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryPolicy};

/// Breaker shared by every database call in the process.
pub const POSTGRES_BREAKER: &str = "postgres";

#[derive(Debug, Clone, Parser)]
#[command(name = "etl-daily", version, about = "Run the daily per-tenant ETL once per date")]
pub struct Args {
    /// Delete existing run records for the date and run again.
    #[arg(long)]
    pub force: bool,

    /// Logical date to process (YYYY-MM-DD). Defaults to today (UTC).
    #[arg(long)]
    pub date: Option<LogicalDate>,

    #[arg(long, default_value = "ETL_DAILY")]
    pub run_type: String,

    /// Tenants processed concurrently per batch.
    #[arg(long, default_value_t = 5)]
    pub batch_size: usize,

    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: u32,

    /// Per-tenant stored procedure.
    #[arg(long, default_value = finpulse_infra::jobs::DEFAULT_PROCEDURE)]
    pub procedure: String,

    /// Minutes after which a RUNNING record is considered crashed.
    #[arg(long, default_value_t = DEFAULT_STALE_THRESHOLD.as_secs() / 60)]
    pub stale_after_minutes: u64,

    /// Recorded on the run row.
    #[arg(long, default_value = "cli")]
    pub trigger_source: String,
}

impl Args {
    pub fn logical_date(&self) -> LogicalDate {
        self.date.unwrap_or_else(LogicalDate::today)
    }

    pub fn run_request(&self) -> RunRequest {
        RunRequest::new(self.run_type.clone(), self.logical_date())
            .with_trigger_source(self.trigger_source.clone())
            .with_force(self.force)
    }

    pub fn runner_config(&self) -> JobRunnerConfig {
        JobRunnerConfig::default()
            .with_batch_size(self.batch_size)
            .with_stale_threshold(Duration::from_secs(self.stale_after_minutes.saturating_mul(60)))
    }
}

/// Run the job and return the process exit code.
///
/// Setup failures (bad procedure name, unreachable database, schema errors)
/// are returned as `Err`; everything after the run record exists is reported
/// through the exit code.
pub async fn execute(args: Args) -> Result<i32> {
    let request = args.run_request();
    info!(
        run_type = %request.run_type,
        logical_date = %request.logical_date,
        force = request.force,
        batch_size = args.batch_size,
        "etl-daily starting"
    );

    let pool = db::connect(&DbConfig::new(&args.database_url).with_max_connections(args.max_connections))
        .await
        .context("connecting to Postgres")?;

    let store = PostgresRunStore::new(pool.clone());
    store.ensure_schema().await.context("applying job_runs schema")?;

    let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
    let breaker = breakers.get(POSTGRES_BREAKER);
    let retry = RetryPolicy::default();

    let source = PostgresWorkUnitSource::new(pool.clone(), breaker.clone(), retry.clone());
    let pipeline = SqlUnitPipeline::new(pool, breaker, retry)
        .with_procedure(&args.procedure)
        .context("configuring unit pipeline")?;

    let runner = JobRunner::new(store, Arc::new(source), Arc::new(pipeline), args.runner_config());

    let code = match runner.run(&request).await {
        Ok(outcome) => {
            print!("{}", render(&outcome));
            outcome.exit_code()
        }
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("error: {e}");
            e.exit_code()
        }
    };

    for snapshot in breakers.snapshots() {
        debug!(
            breaker = %snapshot.name,
            state = %snapshot.state,
            consecutive_failures = snapshot.consecutive_failures,
            "circuit state at exit"
        );
    }

    Ok(code)
}

/// Human-readable summary printed to stdout.
pub fn render(outcome: &JobOutcome) -> String {
    let mut out = String::new();
    match outcome {
        JobOutcome::Skipped {
            reason,
            existing_run_id,
        } => {
            let _ = writeln!(out, "skipped: {reason}");
            if let Some(id) = existing_run_id {
                let _ = writeln!(out, "existing run: {id}");
            }
        }
        JobOutcome::Completed(report) => {
            let _ = writeln!(
                out,
                "{} {} {}: {}/{} units succeeded, {} records inserted in {:.1}s",
                report.run_type,
                report.logical_date,
                report.status,
                report.units_succeeded,
                report.units_processed,
                report.records_inserted,
                report.duration.as_secs_f64()
            );
            let _ = writeln!(out, "run id: {}", report.run_id);
            for failure in &report.failures {
                let _ = writeln!(
                    out,
                    "  failed: {} ({}): {}",
                    failure.unit_name, failure.unit_id, failure.message
                );
            }
        }
    }
    out
}
