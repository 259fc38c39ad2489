//! Idempotent daily batch jobs.
//!
//! ## Design
//!
//! - A run is keyed by `(run_type, logical_date)` and guarded by [`crate::runs`]
//! - Work units (tenants) are independent; one failing never aborts the rest
//! - Units are fanned out in fixed-size batches to bound load on shared
//!   dependencies
//! - The run ends `SUCCESS`, `PARTIAL` or `FAILED` depending on how many
//!   units failed
//!
//! ## Components
//!
//! - `WorkUnitSource` / `UnitPipeline`: injected collaborators
//! - `JobRunner`: the run sequence
//! - `PostgresWorkUnitSource` / `SqlUnitPipeline`: production adapters

pub mod postgres;
pub mod runner;
pub mod types;

pub use postgres::{DEFAULT_PROCEDURE, PostgresWorkUnitSource, SqlUnitPipeline};
pub use runner::JobRunner;
pub use types::{
    JobError, JobOutcome, JobReport, JobRunnerConfig, PipelineError, RunRequest, UnitFailure,
    UnitPipeline, UnitStats, WorkUnit, WorkUnitSource,
};
