//! `finpulse-ai`
//!
//! **Responsibility:** the boundary to the metered LLM analysis dependency.
//!
//! This crate is intentionally **not** part of the ETL pipeline:
//! - It must not write tenant financial data.
//! - It produces **insights**, which callers may cache or display.
//! - It knows nothing about breakers, retries or caches; infra wraps
//!   [`AnalysisProvider`] with those.

pub mod provider;
pub mod request;
pub mod result;

pub use provider::AnalysisProvider;
pub use request::{AnalysisKind, AnalysisRequest};
pub use result::{AiError, AnalysisResult};
