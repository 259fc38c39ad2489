//! AI analysis adapters (optional subsystem).
//!
//! LLM calls are metered and flaky. Everything here fronts them with the
//! resilience primitives; failures are surfaced to the caller, never retried
//! past the policy.

pub mod guarded_analyzer;

pub use guarded_analyzer::{AnalyzeError, GuardedAnalyzer};
