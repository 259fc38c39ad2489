//! Errors raised while building core values from untrusted input.

use thiserror::Error;

/// A value could not be constructed.
///
/// These are input problems (CLI flags, stored rows, config), never I/O.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// A tenant or run identifier did not parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Not a `YYYY-MM-DD` calendar date.
    #[error("invalid logical date: {0}")]
    InvalidDate(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_date(msg: impl Into<String>) -> Self {
        Self::InvalidDate(msg.into())
    }
}
