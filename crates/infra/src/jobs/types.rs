//! Job runner types: work units, requests, outcomes and errors.

use std::time::Duration;

use serde::Serialize;

use finpulse_core::{LogicalDate, TenantId};
use finpulse_resilience::BreakerError;

use crate::db::DbError;
use crate::runs::{RunId, RunStatus, RunTrackerError};

/// One independently processable slice of a run (one tenant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkUnit {
    pub id: TenantId,
    pub name: String,
}

impl WorkUnit {
    pub fn new(id: TenantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// What a successful unit produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitStats {
    pub records_inserted: u64,
}

/// Lists the work units for a run.
#[async_trait::async_trait]
pub trait WorkUnitSource: Send + Sync {
    async fn list_units(&self) -> Result<Vec<WorkUnit>, PipelineError>;
}

/// The per-unit business pipeline. Must be safe to run concurrently for
/// different units.
#[async_trait::async_trait]
pub trait UnitPipeline: Send + Sync {
    async fn run_unit(
        &self,
        unit: &WorkUnit,
        logical_date: LogicalDate,
    ) -> Result<UnitStats, PipelineError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Db(#[from] DbError),

    /// A dependency's circuit is open.
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

impl PipelineError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<BreakerError<DbError>> for PipelineError {
    fn from(err: BreakerError<DbError>) -> Self {
        match err {
            BreakerError::Inner(db) => Self::Db(db),
            open @ BreakerError::Open { .. } => Self::Unavailable(open.to_string()),
        }
    }
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Units processed concurrently per batch.
    pub batch_size: usize,
    /// Age after which a `RUNNING` record is reclaimed.
    pub stale_threshold: Duration,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            stale_threshold: crate::runs::DEFAULT_STALE_THRESHOLD,
        }
    }
}

impl JobRunnerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }
}

/// A request to execute one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub run_type: String,
    pub logical_date: LogicalDate,
    pub trigger_source: String,
    /// Delete prior records for the key first, bypassing the idempotency guard.
    pub force: bool,
}

impl RunRequest {
    pub fn new(run_type: impl Into<String>, logical_date: LogicalDate) -> Self {
        Self {
            run_type: run_type.into(),
            logical_date,
            trigger_source: "manual".to_string(),
            force: false,
        }
    }

    pub fn with_trigger_source(mut self, source: impl Into<String>) -> Self {
        self.trigger_source = source.into();
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// A unit that failed, for the report and the logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit_id: TenantId,
    pub unit_name: String,
    pub message: String,
}

/// Summary of a run that reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub run_id: RunId,
    pub run_type: String,
    pub logical_date: LogicalDate,
    pub status: RunStatus,
    /// Units attempted, failed ones included.
    pub units_processed: usize,
    pub units_succeeded: usize,
    pub units_failed: usize,
    pub records_inserted: u64,
    pub failures: Vec<UnitFailure>,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum JobOutcome {
    /// The idempotency guard declined the run. Not an error.
    Skipped {
        reason: String,
        existing_run_id: Option<RunId>,
    },
    Completed(JobReport),
}

impl JobOutcome {
    /// Process exit code: `0` success or skipped, `2` partial, `1` failed.
    pub fn exit_code(&self) -> i32 {
        match self {
            JobOutcome::Skipped { .. } => 0,
            JobOutcome::Completed(report) => match report.status {
                RunStatus::Success => 0,
                RunStatus::Partial => 2,
                RunStatus::Failed | RunStatus::Running => 1,
            },
        }
    }

    pub fn report(&self) -> Option<&JobReport> {
        match self {
            JobOutcome::Completed(report) => Some(report),
            JobOutcome::Skipped { .. } => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Tracker(#[from] RunTrackerError),

    #[error("failed to list work units: {0}")]
    ListUnits(#[source] PipelineError),
}

impl JobError {
    pub fn exit_code(&self) -> i32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: RunStatus) -> JobOutcome {
        JobOutcome::Completed(JobReport {
            run_id: RunId::new(),
            run_type: "ETL_DAILY".into(),
            logical_date: LogicalDate::from_ymd(2025, 11, 10).unwrap(),
            status,
            units_processed: 0,
            units_succeeded: 0,
            units_failed: 0,
            records_inserted: 0,
            failures: Vec::new(),
            duration: Duration::ZERO,
        })
    }

    #[test]
    fn exit_codes() {
        let skipped = JobOutcome::Skipped {
            reason: "already succeeded".into(),
            existing_run_id: None,
        };
        assert_eq!(skipped.exit_code(), 0);
        assert!(skipped.report().is_none());
        assert_eq!(report(RunStatus::Success).exit_code(), 0);
        assert_eq!(report(RunStatus::Partial).exit_code(), 2);
        assert_eq!(report(RunStatus::Failed).exit_code(), 1);
    }

    #[test]
    fn open_circuit_becomes_unavailable() {
        let err: PipelineError = BreakerError::<DbError>::Open {
            name: "postgres".into(),
            retry_after: Duration::from_secs(30),
        }
        .into();
        assert!(matches!(&err, PipelineError::Unavailable(msg) if msg.contains("circuit open")));
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        assert_eq!(JobRunnerConfig::default().with_batch_size(0).batch_size, 1);
    }
}
