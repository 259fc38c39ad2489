//! Run record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use finpulse_core::LogicalDate;

use super::types::{RunId, RunRecord, RunStatus};

/// Persistence for run records.
///
/// Implementations must reject a second record holding the claim
/// ([`RunStatus::holds_claim`](super::RunStatus::holds_claim)) for the same
/// `(run_type, logical_date)` with [`RunStoreError::Conflict`]. That rule is
/// the only cross-process guard against duplicate runs.
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    async fn insert(&self, record: &RunRecord) -> Result<(), RunStoreError>;

    async fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, RunStoreError>;

    /// Most recently started record for the key.
    async fn latest_for(
        &self,
        run_type: &str,
        logical_date: LogicalDate,
    ) -> Result<Option<RunRecord>, RunStoreError>;

    /// Overwrite the mutable columns of an existing record, but only while its
    /// stored status is one of `expected`.
    ///
    /// Returns `false` and leaves the row untouched when another writer moved
    /// it to a status outside `expected` first.
    async fn update(&self, record: &RunRecord, expected: &[RunStatus]) -> Result<bool, RunStoreError>;

    /// Returns the number of records removed.
    async fn delete_for_date(
        &self,
        run_type: &str,
        logical_date: LogicalDate,
    ) -> Result<u64, RunStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RunStoreError {
    #[error("run already claimed for {run_type} on {logical_date}")]
    Conflict {
        run_type: String,
        logical_date: LogicalDate,
    },
    #[error("run not found: {0}")]
    NotFound(RunId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory run store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, RunRecord>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every stored record, oldest first.
    pub fn all(&self) -> Vec<RunRecord> {
        let runs = self.runs.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = runs.values().cloned().collect();
        all.sort_by_key(|r| r.started_at);
        all
    }
}

fn poisoned<T>(_: T) -> RunStoreError {
    RunStoreError::Storage("run store lock poisoned".to_string())
}

fn claim_conflict(
    runs: &HashMap<RunId, RunRecord>,
    record: &RunRecord,
) -> Result<(), RunStoreError> {
    if !record.status.holds_claim() {
        return Ok(());
    }
    let taken = runs.values().any(|r| {
        r.id != record.id
            && r.run_type == record.run_type
            && r.logical_date == record.logical_date
            && r.status.holds_claim()
    });
    if taken {
        return Err(RunStoreError::Conflict {
            run_type: record.run_type.clone(),
            logical_date: record.logical_date,
        });
    }
    Ok(())
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert(&self, record: &RunRecord) -> Result<(), RunStoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        claim_conflict(&runs, record)?;
        runs.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, RunStoreError> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs.get(&run_id).cloned())
    }

    async fn latest_for(
        &self,
        run_type: &str,
        logical_date: LogicalDate,
    ) -> Result<Option<RunRecord>, RunStoreError> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs
            .values()
            .filter(|r| r.run_type == run_type && r.logical_date == logical_date)
            .max_by_key(|r| (r.started_at, r.id.0))
            .cloned())
    }

    async fn update(&self, record: &RunRecord, expected: &[RunStatus]) -> Result<bool, RunStoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        let Some(current) = runs.get(&record.id) else {
            return Err(RunStoreError::NotFound(record.id));
        };
        if !expected.contains(&current.status) {
            return Ok(false);
        }
        claim_conflict(&runs, record)?;
        runs.insert(record.id, record.clone());
        Ok(true)
    }

    async fn delete_for_date(
        &self,
        run_type: &str,
        logical_date: LogicalDate,
    ) -> Result<u64, RunStoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        let before = runs.len();
        runs.retain(|_, r| !(r.run_type == run_type && r.logical_date == logical_date));
        Ok((before - runs.len()) as u64)
    }
}

#[async_trait::async_trait]
impl<S: RunStore + ?Sized> RunStore for Arc<S> {
    async fn insert(&self, record: &RunRecord) -> Result<(), RunStoreError> {
        (**self).insert(record).await
    }

    async fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, RunStoreError> {
        (**self).get(run_id).await
    }

    async fn latest_for(
        &self,
        run_type: &str,
        logical_date: LogicalDate,
    ) -> Result<Option<RunRecord>, RunStoreError> {
        (**self).latest_for(run_type, logical_date).await
    }

    async fn update(&self, record: &RunRecord, expected: &[RunStatus]) -> Result<bool, RunStoreError> {
        (**self).update(record, expected).await
    }

    async fn delete_for_date(
        &self,
        run_type: &str,
        logical_date: LogicalDate,
    ) -> Result<u64, RunStoreError> {
        (**self).delete_for_date(run_type, logical_date).await
    }
}
