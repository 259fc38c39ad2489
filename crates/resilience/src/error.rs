//! Error classification for external calls.
//!
//! Errors fall into three buckets:
//!
//! | Bucket                | Examples                                  | Handling                     |
//! |-----------------------|-------------------------------------------|------------------------------|
//! | transient / retryable | connection reset, timeout, upstream 5xx   | retried by `retry_with_backoff` |
//! | fatal                 | validation, missing credentials, 4xx      | surfaced on first occurrence |
//! | dependency-exhausted  | circuit open                              | fail fast, never retried     |
//!
//! The breaker rejection lives in [`crate::circuit_breaker::BreakerError`].

use thiserror::Error;

/// Facts about an error that retry/breaker policies classify on.
///
/// Every method has a conservative default so plain error types only need to
/// override what they actually know.
pub trait Classify {
    /// Machine-readable code (e.g. `ECONNRESET`), matched against a retry allow-list.
    fn code(&self) -> Option<&str> {
        None
    }

    /// Upstream HTTP status, if the error came from an HTTP response.
    fn status(&self) -> Option<u16> {
        None
    }

    /// The call timed out or was aborted.
    fn is_timeout(&self) -> bool {
        false
    }

    /// Transient without consulting any allow-list: timeout/abort or upstream 5xx.
    fn is_transient(&self) -> bool {
        self.is_timeout() || self.status().is_some_and(|s| (500..600).contains(&s))
    }
}

/// Error surfaced by an external dependency client (LLM, messaging, row store).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalError {
    #[error("{dependency} responded with HTTP {status}: {message}")]
    Http {
        dependency: String,
        status: u16,
        message: String,
    },

    #[error("{dependency} connection error ({code}): {message}")]
    Connection {
        dependency: String,
        code: String,
        message: String,
    },

    #[error("{dependency} timed out")]
    Timeout { dependency: String },

    #[error("{dependency} request aborted")]
    Aborted { dependency: String },

    #[error("invalid request to {dependency}: {message}")]
    Validation { dependency: String, message: String },

    #[error("missing credentials for {dependency}")]
    MissingCredentials { dependency: String },
}

impl ExternalError {
    pub fn http(dependency: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            dependency: dependency.into(),
            status,
            message: message.into(),
        }
    }

    pub fn connection(
        dependency: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Connection {
            dependency: dependency.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn timeout(dependency: impl Into<String>) -> Self {
        Self::Timeout {
            dependency: dependency.into(),
        }
    }

    pub fn validation(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    pub fn dependency(&self) -> &str {
        match self {
            Self::Http { dependency, .. }
            | Self::Connection { dependency, .. }
            | Self::Timeout { dependency }
            | Self::Aborted { dependency }
            | Self::Validation { dependency, .. }
            | Self::MissingCredentials { dependency } => dependency,
        }
    }
}

impl Classify for ExternalError {
    fn code(&self) -> Option<&str> {
        match self {
            Self::Connection { code, .. } => Some(code),
            _ => None,
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Aborted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_5xx_and_timeouts_are_transient() {
        assert!(ExternalError::http("llm", 503, "overloaded").is_transient());
        assert!(ExternalError::timeout("llm").is_transient());
        assert!(
            ExternalError::Aborted {
                dependency: "llm".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn client_errors_are_not_transient_by_default() {
        assert!(!ExternalError::http("llm", 401, "bad key").is_transient());
        assert!(!ExternalError::validation("llm", "prompt too long").is_transient());
        // Connection codes are only retryable through a policy allow-list.
        assert!(!ExternalError::connection("db", "ECONNRESET", "reset").is_transient());
    }
}
