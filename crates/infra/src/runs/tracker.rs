//! Idempotency policy over the run store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use finpulse_core::LogicalDate;
use finpulse_resilience::{Clock, SystemClock};

use super::store::{RunStore, RunStoreError};
use super::types::{IdempotencyDecision, RunDetails, RunId, RunRecord, RunStatus};

/// Default age after which a `RUNNING` record is considered abandoned.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error)]
pub enum RunTrackerError {
    /// Another process holds the claim for this key.
    #[error("run already claimed for {run_type} on {logical_date}")]
    Conflict {
        run_type: String,
        logical_date: LogicalDate,
    },
    #[error("run not found: {0}")]
    NotFound(RunId),
    #[error("invalid run transition for {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },
    #[error(transparent)]
    Store(RunStoreError),
}

impl From<RunStoreError> for RunTrackerError {
    fn from(err: RunStoreError) -> Self {
        match err {
            RunStoreError::Conflict {
                run_type,
                logical_date,
            } => Self::Conflict {
                run_type,
                logical_date,
            },
            RunStoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Decides whether a run may start, claims it and closes it.
///
/// The check in [`ensure_idempotency`](Self::ensure_idempotency) is advisory;
/// the store's uniqueness rule is what actually prevents two concurrent runs.
pub struct RunTracker {
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    stale_threshold: Duration,
}

impl RunTracker {
    pub fn new(store: impl RunStore + 'static) -> Self {
        Self {
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Inspect the latest record for the key and decide.
    ///
    /// | latest record              | decision                           |
    /// |----------------------------|------------------------------------|
    /// | none                       | proceed                            |
    /// | `SUCCESS`                  | block                              |
    /// | `RUNNING`, younger than threshold | block                       |
    /// | `RUNNING`, at/over threshold | mark `FAILED` (stale), proceed   |
    /// | `FAILED` / `PARTIAL`       | proceed (retry)                    |
    ///
    /// The stale write only lands while the row is still `RUNNING`. If its
    /// owner closed it first, the record is re-read and decided again.
    pub async fn ensure_idempotency(
        &self,
        run_type: &str,
        logical_date: LogicalDate,
    ) -> Result<IdempotencyDecision, RunTrackerError> {
        loop {
            let Some(latest) = self.store.latest_for(run_type, logical_date).await? else {
                return Ok(IdempotencyDecision::proceed("no previous run", None));
            };

            let decision = match latest.status {
                RunStatus::Success => IdempotencyDecision::blocked(
                    format!("{run_type} already succeeded for {logical_date}"),
                    latest.id,
                ),
                RunStatus::Running => {
                    let now = self.clock.now();
                    let age = latest.age(now);
                    if age < self.stale_threshold {
                        IdempotencyDecision::blocked(
                            format!(
                                "{run_type} for {logical_date} is already running (started {}s ago)",
                                age.as_secs()
                            ),
                            latest.id,
                        )
                    } else {
                        let message = format!(
                            "stale/timeout: run still RUNNING after {}s (threshold {}s)",
                            age.as_secs(),
                            self.stale_threshold.as_secs()
                        );
                        let mut stale = latest;
                        stale.finish(
                            RunStatus::Failed,
                            RunDetails::default().with_error(message).with_duration(age),
                            now,
                        );
                        if !self.store.update(&stale, &[RunStatus::Running]).await? {
                            // The owner closed it between our read and write.
                            info!(run_id = %stale.id, run_type, "stale run changed under us, re-reading");
                            continue;
                        }
                        warn!(
                            run_id = %stale.id,
                            run_type,
                            logical_date = %logical_date,
                            age_secs = age.as_secs(),
                            "reclaimed stale run"
                        );
                        IdempotencyDecision::proceed(
                            "previous run was stale and marked failed",
                            Some(stale.id),
                        )
                    }
                }
                RunStatus::Failed | RunStatus::Partial => IdempotencyDecision::proceed(
                    format!("retrying after {} run", latest.status),
                    Some(latest.id),
                ),
            };

            return Ok(decision);
        }
    }

    /// Insert a `RUNNING` record. A concurrent claim surfaces as
    /// [`RunTrackerError::Conflict`].
    pub async fn create_run_record(
        &self,
        run_type: &str,
        logical_date: LogicalDate,
        trigger_source: &str,
    ) -> Result<RunId, RunTrackerError> {
        let record = RunRecord::running(run_type, logical_date, trigger_source, self.clock.now());
        self.store.insert(&record).await?;

        info!(
            run_id = %record.id,
            run_type,
            logical_date = %logical_date,
            trigger_source,
            "run started"
        );
        Ok(record.id)
    }

    /// Close a run with a terminal status.
    ///
    /// Writing the status a run already has rewrites its details; any other
    /// change after the first terminal write is rejected, including one that
    /// races another writer in storage.
    pub async fn update_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        details: RunDetails,
    ) -> Result<RunRecord, RunTrackerError> {
        let mut record = self
            .store
            .get(run_id)
            .await?
            .ok_or(RunTrackerError::NotFound(run_id))?;

        let allowed = status.is_terminal()
            && (record.status == RunStatus::Running || record.status == status);
        if !allowed {
            return Err(RunTrackerError::InvalidTransition {
                run_id,
                from: record.status,
                to: status,
            });
        }

        record.finish(status, details, self.clock.now());
        if !self.store.update(&record, &[RunStatus::Running, status]).await? {
            let current = self
                .store
                .get(run_id)
                .await?
                .ok_or(RunTrackerError::NotFound(run_id))?;
            return Err(RunTrackerError::InvalidTransition {
                run_id,
                from: current.status,
                to: status,
            });
        }

        info!(
            run_id = %run_id,
            run_type = %record.run_type,
            status = %status,
            units_processed = record.units_processed,
            records_inserted = record.records_inserted,
            duration_seconds = record.duration_seconds,
            "run finished"
        );
        Ok(record)
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, RunTrackerError> {
        Ok(self.store.get(run_id).await?)
    }

    /// Drop every record for the key so a forced run can claim it.
    pub async fn delete_runs_for_date(
        &self,
        run_type: &str,
        logical_date: LogicalDate,
    ) -> Result<u64, RunTrackerError> {
        Ok(self.store.delete_for_date(run_type, logical_date).await?)
    }
}
