//! `finpulse-resilience`
//!
//! **Responsibility:** the primitives every external call in the job layer is
//! wrapped with.
//!
//! - [`CircuitBreaker`]: per-dependency fail-fast gate
//! - [`retry_with_backoff`]: bounded exponential backoff around a fallible call
//! - [`TtlCache`]: time-bounded memoization in front of expensive calls
//! - [`batch`]: bounded-concurrency fan-out with per-item failure isolation
//!
//! Nothing in here is a process-wide singleton. Instances are constructed by
//! the composition root and passed down by reference.
//!
//! ## Composition
//!
//! ```text
//! cache.get_or_insert_with(key, ttl, || breaker.execute(|| retry_with_backoff(&policy, call)))
//! ```
//!
//! The breaker sees the whole retry sequence as one outcome.

pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod retry;

pub use batch::{
    BatchResult, BatchSummary, process_in_batches, process_in_batches_with_retry,
    process_with_concurrency_limit,
};
pub use cache::{CacheEntry, CacheError, CacheStats, SweeperHandle, TtlCache};
pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot,
    CircuitState, FailureAccounting,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Classify, ExternalError};
pub use retry::{RetryPolicy, retry_with_backoff, retry_with_backoff_observed};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// State guarded here is plain counters/maps that stay consistent between
/// statements, so a poisoned lock is still safe to read.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
