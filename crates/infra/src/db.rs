//! Postgres connection wiring and error classification.
//!
//! ## Classification
//!
//! | SQLx error                       | Code reported        | Transient |
//! |----------------------------------|----------------------|-----------|
//! | Database, SQLSTATE class `08`    | SQLSTATE             | yes       |
//! | Database `40001` / `40P01`       | SQLSTATE             | yes       |
//! | Database `57P01` (admin shutdown)| SQLSTATE             | yes       |
//! | Database (other)                 | SQLSTATE             | no        |
//! | Io (reset/refused/pipe/timeout)  | `ECONNRESET` etc.    | via retry allow-list |
//! | PoolTimedOut                     | none                 | yes (timeout) |
//! | anything else                    | none                 | no        |

use std::io::ErrorKind;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use finpulse_resilience::Classify;

/// A `sqlx` error with its retry classification resolved up front.
#[derive(Debug, Error)]
#[error("database error in {operation}: {source}")]
pub struct DbError {
    operation: &'static str,
    code: Option<String>,
    #[source]
    source: sqlx::Error,
}

impl DbError {
    pub fn new(operation: &'static str, source: sqlx::Error) -> Self {
        let code = match &source {
            sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
            sqlx::Error::Io(io) => io_code(io.kind()).map(str::to_string),
            _ => None,
        };
        Self {
            operation,
            code,
            source,
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// `23505`: a unique index rejected the write.
    pub fn is_unique_violation(&self) -> bool {
        self.code.as_deref() == Some("23505")
    }

    pub fn into_source(self) -> sqlx::Error {
        self.source
    }
}

fn io_code(kind: ErrorKind) -> Option<&'static str> {
    match kind {
        ErrorKind::ConnectionReset => Some("ECONNRESET"),
        ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
        ErrorKind::BrokenPipe => Some("EPIPE"),
        ErrorKind::TimedOut => Some("ETIMEDOUT"),
        _ => None,
    }
}

impl Classify for DbError {
    fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    fn is_timeout(&self) -> bool {
        matches!(self.source, sqlx::Error::PoolTimedOut)
    }

    fn is_transient(&self) -> bool {
        if self.is_timeout() {
            return true;
        }
        match (&self.source, self.code.as_deref()) {
            (sqlx::Error::Database(_), Some(code)) => {
                code.starts_with("08") || matches!(code, "40001" | "40P01" | "57P01")
            }
            _ => false,
        }
    }
}

/// Pool settings for the job binary.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DbConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

pub async fn connect(config: &DbConfig) -> Result<PgPool, DbError> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.url)
        .await
        .map_err(|e| DbError::new("connect", e))
}
