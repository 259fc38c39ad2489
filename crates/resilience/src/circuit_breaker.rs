//! Per-dependency circuit breaker.
//!
//! ## States
//!
//! ```text
//! Closed --failures >= threshold--> Open --reset_timeout elapsed--> HalfOpen
//! HalfOpen --success_threshold successes--> Closed
//! HalfOpen --any failure--> Open
//! ```
//!
//! A failure trips the breaker when either the consecutive-failure count or the
//! number of failures inside `monitoring_window` reaches `failure_threshold`.
//! While Open, calls are rejected with [`BreakerError::Open`] without invoking
//! the wrapped function. The first call after `reset_timeout` is let through as
//! a trial call.
//!
//! The breaker never swallows errors: the wrapped function's error comes back
//! as [`BreakerError::Inner`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock, elapsed};
use crate::error::Classify;
use crate::lock;

/// Circuit breaker state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Which errors count against the failure budget.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum FailureAccounting {
    /// Every error counts, including validation-class ones.
    #[default]
    AllErrors,
    /// Only [`Classify::is_transient`] errors count; fatal errors pass through
    /// without touching breaker state.
    TransientOnly,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures (consecutive, or within the window) that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed.
    pub reset_timeout: Duration,
    /// Sliding window for counting non-consecutive failures.
    pub monitoring_window: Duration,
    /// Successful trial calls needed in HalfOpen to close again.
    pub success_threshold: u32,
    pub accounting: FailureAccounting,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(120),
            success_threshold: 2,
            accounting: FailureAccounting::AllErrors,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_monitoring_window(mut self, window: Duration) -> Self {
        self.monitoring_window = window;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_accounting(mut self, accounting: FailureAccounting) -> Self {
        self.accounting = accounting;
        self
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The circuit is open; the wrapped function was not called.
    Open { name: String, retry_after: Duration },
    /// The wrapped function failed; its error is passed through untouched.
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Open { retry_after, .. } => Some(*retry_after),
            Self::Inner(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { name, retry_after } => write!(
                f,
                "{name} is unavailable (circuit open); retry in {}s",
                retry_after.as_secs_f64().ceil() as u64
            ),
            Self::Inner(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { .. } => None,
            Self::Inner(e) => e.source(),
        }
    }
}

// An open circuit is never retryable: retrying would just hammer the gate.
impl<E: Classify> Classify for BreakerError<E> {
    fn code(&self) -> Option<&str> {
        match self {
            Self::Inner(e) => e.code(),
            Self::Open { .. } => None,
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            Self::Inner(e) => e.status(),
            Self::Open { .. } => None,
        }
    }

    fn is_timeout(&self) -> bool {
        match self {
            Self::Inner(e) => e.is_timeout(),
            Self::Open { .. } => false,
        }
    }
}

/// Point-in-time view of a breaker, for logs and health output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub window_failures: usize,
    pub half_open_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Remaining wait before a trial call is allowed (only while Open).
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    failure_timestamps: VecDeque<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    half_open_successes: u32,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            failure_timestamps: VecDeque::new(),
            last_failure_at: None,
            half_open_successes: 0,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        while let Some(oldest) = self.failure_timestamps.front() {
            if elapsed(*oldest, now) > window {
                self.failure_timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn remaining_open(&self, now: DateTime<Utc>, reset_timeout: Duration) -> Duration {
        match self.last_failure_at {
            Some(at) => reset_timeout.saturating_sub(elapsed(at, now)),
            None => Duration::ZERO,
        }
    }
}

/// Fail-fast gate in front of one external dependency.
///
/// State is mutated only in short synchronous sections; the lock is never held
/// across the wrapped call's `.await`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        lock(&self.state).state
    }

    /// Run `f` through the breaker.
    ///
    /// Wrap a retried call (`breaker.execute(|| retry_with_backoff(..))`) to have
    /// the whole retry sequence count as a single outcome.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.acquire::<E>()?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if self.config.accounting == FailureAccounting::TransientOnly
                    && !err.is_transient()
                {
                    debug!(breaker = %self.name, "fatal error not counted against breaker");
                } else {
                    self.record_failure();
                }
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Gate check. Moves Open -> HalfOpen once the reset timeout has elapsed.
    fn acquire<E>(&self) -> Result<(), BreakerError<E>> {
        let now = self.clock.now();
        let mut st = lock(&self.state);

        if st.state != CircuitState::Open {
            return Ok(());
        }

        let remaining = st.remaining_open(now, self.config.reset_timeout);
        if remaining.is_zero() {
            st.state = CircuitState::HalfOpen;
            st.half_open_successes = 0;
            info!(breaker = %self.name, "circuit half-open, probing dependency");
            return Ok(());
        }

        debug!(
            breaker = %self.name,
            retry_after_ms = remaining.as_millis() as u64,
            "circuit open, rejecting call"
        );
        Err(BreakerError::Open {
            name: self.name.clone(),
            retry_after: remaining,
        })
    }

    fn record_success(&self) {
        let mut st = lock(&self.state);
        match st.state {
            CircuitState::HalfOpen => {
                st.half_open_successes += 1;
                if st.half_open_successes >= self.config.success_threshold {
                    *st = BreakerState::new();
                    info!(breaker = %self.name, "circuit closed, dependency recovered");
                }
            }
            CircuitState::Closed => st.consecutive_failures = 0,
            // A call admitted before the circuit opened finished late.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let now = self.clock.now();
        let mut st = lock(&self.state);

        st.consecutive_failures += 1;
        st.failure_timestamps.push_back(now);
        st.last_failure_at = Some(now);
        st.prune(now, self.config.monitoring_window);

        let threshold = self.config.failure_threshold;
        let tripped = st.state == CircuitState::HalfOpen
            || st.consecutive_failures >= threshold
            || st.failure_timestamps.len() >= threshold as usize;

        if tripped && st.state != CircuitState::Open {
            warn!(
                breaker = %self.name,
                from = %st.state,
                consecutive_failures = st.consecutive_failures,
                window_failures = st.failure_timestamps.len(),
                "circuit opened"
            );
            st.state = CircuitState::Open;
            st.half_open_successes = 0;
        }
    }

    /// Force the breaker back to Closed and forget failure history.
    pub fn reset(&self) {
        *lock(&self.state) = BreakerState::new();
        info!(breaker = %self.name, "circuit manually reset");
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = self.clock.now();
        let mut st = lock(&self.state);
        st.prune(now, self.config.monitoring_window);

        let retry_after_ms = (st.state == CircuitState::Open)
            .then(|| st.remaining_open(now, self.config.reset_timeout).as_millis() as u64);

        CircuitSnapshot {
            name: self.name.clone(),
            state: st.state,
            consecutive_failures: st.consecutive_failures,
            window_failures: st.failure_timestamps.len(),
            half_open_successes: st.half_open_successes,
            last_failure_at: st.last_failure_at,
            retry_after_ms,
        }
    }
}

/// One breaker per dependency name, owned by the composition root.
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self::with_clock(defaults, Arc::new(SystemClock))
    }

    pub fn with_clock(defaults: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            defaults,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the breaker for `name`, creating it with the registry defaults.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = lock(&self.breakers);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_clock(
                    name,
                    self.defaults.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// Register (or replace) a breaker with its own configuration.
    pub fn register(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::with_clock(name, config, self.clock.clone()));
        lock(&self.breakers).insert(name.to_string(), breaker.clone());
        breaker
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<_> = lock(&self.breakers).values().cloned().collect();
        let mut out: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
