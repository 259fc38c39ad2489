//! Bounded exponential-backoff retry.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Classify;

/// Connection-level codes retried by default.
pub const DEFAULT_RETRYABLE_CODES: &[&str] = &[
    "ECONNRESET",
    "ECONNREFUSED",
    "ETIMEDOUT",
    "EPIPE",
    "EAI_AGAIN",
];

/// Retry policy configuration.
///
/// An error is retryable when its code or message matches the allow-lists,
/// when it is an upstream 5xx, or when it is a timeout/abort. Everything else
/// is fatal and returned after the first attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1).
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Error codes treated as retryable (exact match).
    pub retryable_codes: Vec<String>,
    /// Message fragments treated as retryable (case-insensitive substring).
    pub retryable_messages: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            retryable_codes: DEFAULT_RETRYABLE_CODES.iter().map(|c| c.to_string()).collect(),
            retryable_messages: vec!["socket hang up".to_string()],
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_retryable_code(mut self, code: impl Into<String>) -> Self {
        self.retryable_codes.push(code.into());
        self
    }

    pub fn with_retryable_message(mut self, fragment: impl Into<String>) -> Self {
        self.retryable_messages.push(fragment.into().to_lowercase());
        self
    }

    /// Delay to wait after `attempt` (1-indexed) failed:
    /// `min(initial_delay * multiplier^(attempt-1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let nanos = self.initial_delay.as_nanos() as f64 * exp;

        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(nanos.max(0.0) as u64)
        }
    }

    pub fn is_retryable<E>(&self, err: &E) -> bool
    where
        E: Classify + Display,
    {
        if err.is_transient() {
            return true;
        }
        if let Some(code) = err.code() {
            if self.retryable_codes.iter().any(|c| c == code) {
                return true;
            }
        }
        if self.retryable_messages.is_empty() {
            return false;
        }
        let message = err.to_string().to_lowercase();
        self.retryable_messages
            .iter()
            .any(|fragment| message.contains(&fragment.to_lowercase()))
    }
}

/// Run `op`, retrying retryable errors per `policy`.
///
/// Each wait is logged at `warn`. After the last attempt the original error is
/// returned unchanged.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    retry_with_backoff_observed(policy, op, |attempt, delay, err: &E| {
        warn!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );
    })
    .await
}

/// Same as [`retry_with_backoff`], with a hook called before each wait.
///
/// The hook receives the failed attempt number, the upcoming delay and the
/// error. It is observational only.
pub async fn retry_with_backoff_observed<T, E, F, Fut, O>(
    policy: &RetryPolicy,
    mut op: F,
    mut on_retry: O,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
    O: FnMut(u32, Duration, &E),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !policy.is_retryable(&err) {
            debug!(attempt, error = %err, "non-retryable error");
            return Err(err);
        }
        if attempt >= max_attempts {
            debug!(attempt, error = %err, "retry attempts exhausted");
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        on_retry(attempt, delay, &err);
        tokio::time::sleep(delay).await;
    }
}
