//! Logging setup shared by every binary in the workspace.
//!
//! Library crates only emit `tracing` events; installing a subscriber is the
//! binary's job, done once through [`init`].

/// Install the global subscriber, honoring `RUST_LOG` and `LOG_FORMAT`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

pub mod tracing;
