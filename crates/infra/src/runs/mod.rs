//! Run tracking for scheduled jobs.
//!
//! ## Design
//!
//! - One record per execution attempt, keyed by `(run_type, logical_date)`
//! - `RUNNING` then exactly one terminal status (`SUCCESS`, `FAILED`, `PARTIAL`)
//! - At most one `RUNNING`/`SUCCESS` record per key, enforced by the store
//! - Abandoned `RUNNING` records are reclaimed after a staleness threshold
//!
//! ## Components
//!
//! - `RunRecord`: persisted row
//! - `RunStore`: persistence (in-memory or Postgres)
//! - `RunTracker`: idempotency policy and state transitions

pub mod postgres;
pub mod store;
pub mod tracker;
pub mod types;

pub use postgres::PostgresRunStore;
pub use store::{InMemoryRunStore, RunStore, RunStoreError};
pub use tracker::{DEFAULT_STALE_THRESHOLD, RunTracker, RunTrackerError};
pub use types::{IdempotencyDecision, RunDetails, RunId, RunRecord, RunStatus};
