//! Infrastructure layer: run tracking, job orchestration, Postgres adapters
//! and guarded external calls.

pub mod ai;
pub mod db;
pub mod jobs;
pub mod runs;
