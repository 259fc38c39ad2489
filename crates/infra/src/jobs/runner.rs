//! Idempotent batch job runner.
//!
//! A unit that returns an error or panics is recorded as a failure; the rest
//! of the batch carries on.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{error, info, warn};

use finpulse_resilience::{BatchSummary, Clock, process_in_batches};

use super::types::{
    JobError, JobOutcome, JobReport, JobRunnerConfig, PipelineError, RunRequest, UnitFailure,
    UnitPipeline, WorkUnit, WorkUnitSource,
};
use crate::runs::{RunDetails, RunStatus, RunStore, RunTracker, RunTrackerError};

/// Failures listed verbatim in the run record's error message.
const MAX_FAILURES_IN_MESSAGE: usize = 5;

/// Runs one `(run_type, logical_date)` end to end:
/// guard, claim, list units, fan out in batches, close the record.
///
/// A failing unit never aborts the run; it is recorded and the run ends
/// `PARTIAL` (or `FAILED` if nothing succeeded).
pub struct JobRunner {
    tracker: RunTracker,
    source: Arc<dyn WorkUnitSource>,
    pipeline: Arc<dyn UnitPipeline>,
    config: JobRunnerConfig,
}

impl JobRunner {
    pub fn new(
        store: impl RunStore + 'static,
        source: Arc<dyn WorkUnitSource>,
        pipeline: Arc<dyn UnitPipeline>,
        config: JobRunnerConfig,
    ) -> Self {
        let tracker = RunTracker::new(store).with_stale_threshold(config.stale_threshold);
        Self {
            tracker,
            source,
            pipeline,
            config,
        }
    }

    /// Use `clock` for run timestamps and staleness checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.tracker = self.tracker.with_clock(clock);
        self
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    pub fn config(&self) -> &JobRunnerConfig {
        &self.config
    }

    pub async fn run(&self, request: &RunRequest) -> Result<JobOutcome, JobError> {
        let started = Instant::now();
        let run_type = request.run_type.as_str();
        let logical_date = request.logical_date;

        if request.force {
            let deleted = self
                .tracker
                .delete_runs_for_date(run_type, logical_date)
                .await?;
            warn!(
                run_type,
                logical_date = %logical_date,
                deleted,
                "FORCE: deleted existing run records, idempotency guard bypassed"
            );
        }

        let decision = self
            .tracker
            .ensure_idempotency(run_type, logical_date)
            .await?;
        if !decision.can_proceed {
            info!(
                run_type,
                logical_date = %logical_date,
                existing_run_id = ?decision.existing_run_id,
                reason = %decision.reason,
                "skipping run"
            );
            return Ok(JobOutcome::Skipped {
                reason: decision.reason,
                existing_run_id: decision.existing_run_id,
            });
        }

        let run_id = match self
            .tracker
            .create_run_record(run_type, logical_date, &request.trigger_source)
            .await
        {
            Ok(id) => id,
            Err(RunTrackerError::Conflict { .. }) => {
                info!(
                    run_type,
                    logical_date = %logical_date,
                    "another process claimed the run first, skipping"
                );
                return Ok(JobOutcome::Skipped {
                    reason: format!("{run_type} for {logical_date} was claimed concurrently"),
                    existing_run_id: None,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let units = match self.source.list_units().await {
            Ok(units) => units,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "failed to list work units");
                let details = RunDetails::default()
                    .with_error(format!("failed to list work units: {e}"))
                    .with_duration(started.elapsed());
                if let Err(close) = self
                    .tracker
                    .update_run_status(run_id, RunStatus::Failed, details)
                    .await
                {
                    error!(run_id = %run_id, error = %close, "failed to mark run as failed");
                }
                return Err(JobError::ListUnits(e));
            }
        };

        info!(
            run_id = %run_id,
            units = units.len(),
            batch_size = self.config.batch_size,
            "processing work units"
        );

        let pipeline = &self.pipeline;
        let results = process_in_batches(
            units,
            |unit: WorkUnit| async move {
                let outcome = AssertUnwindSafe(pipeline.run_unit(&unit, logical_date))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(PipelineError::failed(format!(
                            "unit panicked: {}",
                            panic_message(payload.as_ref())
                        )))
                    });
                if let Err(e) = &outcome {
                    warn!(unit_id = %unit.id, unit = %unit.name, error = %e, "work unit failed");
                }
                outcome
            },
            self.config.batch_size,
        )
        .await;

        let summary = BatchSummary::from_results(&results);
        let records_inserted: u64 = results
            .iter()
            .filter_map(|r| r.value())
            .map(|stats| stats.records_inserted)
            .sum();
        let failures: Vec<UnitFailure> = results
            .iter()
            .filter_map(|r| {
                r.error().map(|e: &PipelineError| UnitFailure {
                    unit_id: r.item.id,
                    unit_name: r.item.name.clone(),
                    message: e.to_string(),
                })
            })
            .collect();

        let status = if summary.all_succeeded() {
            RunStatus::Success
        } else if summary.all_failed() {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };

        let duration = started.elapsed();
        let mut details = RunDetails::default()
            .with_counts(summary.total as u32, records_inserted)
            .with_duration(duration);
        if !failures.is_empty() {
            details = details.with_error(failure_message(&failures, summary.total));
        }

        self.tracker
            .update_run_status(run_id, status, details)
            .await?;

        Ok(JobOutcome::Completed(JobReport {
            run_id,
            run_type: request.run_type.clone(),
            logical_date,
            status,
            units_processed: summary.total,
            units_succeeded: summary.succeeded,
            units_failed: summary.failed,
            records_inserted,
            failures,
            duration,
        }))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

fn failure_message(failures: &[UnitFailure], total: usize) -> String {
    let listed: Vec<String> = failures
        .iter()
        .take(MAX_FAILURES_IN_MESSAGE)
        .map(|f| format!("{} ({})", f.unit_name, f.message))
        .collect();
    let mut message = format!(
        "{} of {} units failed: {}",
        failures.len(),
        total,
        listed.join("; ")
    );
    if failures.len() > MAX_FAILURES_IN_MESSAGE {
        message.push_str(&format!("; and {} more", failures.len() - MAX_FAILURES_IN_MESSAGE));
    }
    message
}

#[cfg(test)]
mod tests {
    use finpulse_core::TenantId;

    use super::*;

    fn failure(name: &str) -> UnitFailure {
        UnitFailure {
            unit_id: TenantId::new(),
            unit_name: name.to_string(),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn panic_payloads_become_messages() {
        let literal: Box<dyn Any + Send> = Box::new("index out of bounds");
        let formatted: Box<dyn Any + Send> = Box::new(String::from("tenant T3 has no ledger"));
        let other: Box<dyn Any + Send> = Box::new(7u8);

        assert_eq!(panic_message(literal.as_ref()), "index out of bounds");
        assert_eq!(panic_message(formatted.as_ref()), "tenant T3 has no ledger");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn failure_message_lists_the_first_few() {
        let one = failure_message(&[failure("B")], 3);
        assert_eq!(one, "1 of 3 units failed: B (boom)");

        let many: Vec<_> = (0..7).map(|i| failure(&format!("T{i}"))).collect();
        let message = failure_message(&many, 10);
        assert!(message.starts_with("7 of 10 units failed: T0 (boom); T1 (boom)"));
        assert!(message.ends_with("; and 2 more"));
    }
}
