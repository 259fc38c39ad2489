//! Run records and idempotency decisions.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use finpulse_core::{DomainError, LogicalDate};

/// Unique run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a run: `Running` then exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
            RunStatus::Partial => "PARTIAL",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// Statuses covered by the one-per-(run_type, date) uniqueness rule.
    pub fn holds_claim(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Success)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            "PARTIAL" => Ok(RunStatus::Partial),
            other => Err(DomainError::validation(format!("unknown run status: {other}"))),
        }
    }
}

/// One execution attempt of a scheduled job for a logical date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub run_type: String,
    pub logical_date: LogicalDate,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Who asked for the run (`cron`, `cli`, `manual`, ...).
    pub trigger_source: String,
    pub error_message: Option<String>,
    /// Units attempted, failed ones included.
    pub units_processed: u32,
    pub records_inserted: u64,
    pub duration_seconds: Option<f64>,
}

impl RunRecord {
    pub fn running(
        run_type: impl Into<String>,
        logical_date: LogicalDate,
        trigger_source: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RunId::new(),
            run_type: run_type.into(),
            logical_date,
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            trigger_source: trigger_source.into(),
            error_message: None,
            units_processed: 0,
            records_inserted: 0,
            duration_seconds: None,
        }
    }

    /// Time since the run started, clamped at zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Move to a terminal `status` and stamp the details.
    pub(crate) fn finish(&mut self, status: RunStatus, details: RunDetails, now: DateTime<Utc>) {
        let finished_at = *self.finished_at.get_or_insert(now);
        self.status = status;
        self.error_message = details.error_message;
        self.units_processed = details.units_processed;
        self.records_inserted = details.records_inserted;
        self.duration_seconds = Some(details.duration_seconds.unwrap_or_else(|| {
            (finished_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
        }));
    }
}

/// Outcome details written with a terminal status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunDetails {
    pub error_message: Option<String>,
    pub units_processed: u32,
    pub records_inserted: u64,
    /// Wall-clock duration; derived from the timestamps when absent.
    pub duration_seconds: Option<f64>,
}

impl RunDetails {
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_counts(mut self, units_processed: u32, records_inserted: u64) -> Self {
        self.units_processed = units_processed;
        self.records_inserted = records_inserted;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_seconds = Some(duration.as_secs_f64());
        self
    }
}

/// Whether a new run for `(run_type, logical_date)` may start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdempotencyDecision {
    pub can_proceed: bool,
    pub reason: String,
    pub existing_run_id: Option<RunId>,
}

impl IdempotencyDecision {
    pub fn proceed(reason: impl Into<String>, existing_run_id: Option<RunId>) -> Self {
        Self {
            can_proceed: true,
            reason: reason.into(),
            existing_run_id,
        }
    }

    pub fn blocked(reason: impl Into<String>, existing_run_id: RunId) -> Self {
        Self {
            can_proceed: false,
            reason: reason.into(),
            existing_run_id: Some(existing_run_id),
        }
    }
}
