//! `finpulse-core`: shared identifiers, the logical run date and the error model.
//!
//! This crate contains **pure** building blocks (no infrastructure concerns).
//! Everything tenant-scoped in the job layer keys off [`TenantId`].

pub mod date;
pub mod error;
pub mod id;

pub use date::LogicalDate;
pub use error::DomainError;
pub use id::TenantId;
