use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use finpulse_resilience::Classify;

/// Output of one LLM analysis call.
///
/// This is an insight for display, never a write to tenant data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Human-readable narrative.
    pub summary: String,

    /// Primary score for the analysis (kind-specific meaning).
    pub score: f64,

    /// Confidence in \[0, 1\] (recommended convention; not enforced).
    pub confidence: f64,

    /// Model that produced the result.
    pub model: String,

    /// Free-form metadata (token usage, prompt version, etc).
    pub metadata: JsonValue,
}

impl AnalysisResult {
    pub fn new(summary: impl Into<String>, score: f64, confidence: f64) -> Self {
        Self {
            summary: summary.into(),
            score,
            confidence,
            model: String::new(),
            metadata: JsonValue::Null,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AiError {
    #[error("invalid analysis input: {0}")]
    InvalidInput(String),

    #[error("LLM credentials are not configured")]
    MissingCredentials,

    #[error("LLM provider returned HTTP {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("LLM transport error ({code}): {message}")]
    Transport { code: String, message: String },

    #[error("LLM request timed out")]
    Timeout,

    #[error("malformed LLM response: {0}")]
    MalformedResponse(String),
}

impl AiError {
    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        Self::Provider {
            status,
            message: message.into(),
        }
    }

    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl Classify for AiError {
    fn code(&self) -> Option<&str> {
        match self {
            Self::Transport { code, .. } => Some(code),
            _ => None,
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            Self::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(AiError::provider(503, "overloaded").is_transient());
        assert!(AiError::Timeout.is_transient());
        assert!(!AiError::provider(401, "bad key").is_transient());
        assert!(!AiError::MissingCredentials.is_transient());
        assert_eq!(AiError::transport("ECONNRESET", "reset").code(), Some("ECONNRESET"));
    }

    #[test]
    fn result_round_trips_through_json() {
        let result = AnalysisResult::new("revenue flat", 0.1, 0.8)
            .with_model("gpt-4o-mini")
            .with_metadata(serde_json::json!({"tokens": 812}));

        let value = serde_json::to_value(&result).unwrap();
        let back: AnalysisResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }
}
