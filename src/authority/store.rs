//! Experiment record persistence.
//!
//! The relational store is an external collaborator specified only at this
//! interface: `add`, `delete`, `next_experiment_id`, `retrieve_by` (plus
//! `update`, which the original reached through the same surface).
//! [`MemoryStore`] is the in-process implementation used by tests and
//! single-host deployments.
//!
//! `next_experiment_id` is the identity sequence of one lab-server authority:
//! ids are unique, strictly increasing, and never reused even after deletion.
//! Implementations must serialize it against `add` so no two concurrent
//! submissions observe the same id.

use crate::error::{AppResult, LabError};
use crate::proto::{ResultReport, StatusCode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// One admitted experiment.
#[derive(Clone, Debug)]
pub struct ExperimentRecord {
    /// Identity within this authority's sequence.
    pub experiment_id: i32,
    /// GUID of the owning lab server.
    pub lab_server_guid: String,
    /// Device-tier execution id, mapped once execution starts.
    pub execution_id: Option<i32>,
    /// Current state.
    pub status: StatusCode,
    /// Runtime estimate from validation, seconds.
    pub estimated_runtime: f64,
    /// Guaranteed retention, days.
    pub min_time_to_live: f64,
    /// Submission timestamp.
    pub submitted_at: DateTime<Utc>,
    /// Submitting user group.
    pub user_group: String,
    /// Priority hint supplied at submission.
    pub priority_hint: i32,
    /// Set once a cancel has been forwarded to the device; repeat cancels
    /// while the device winds down return false instead of true again.
    pub cancel_requested: bool,
    /// Final result report, set on terminal transition.
    pub result: Option<ResultReport>,
}

/// Selection criteria for `retrieve_by`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetrieveBy {
    /// A single record by id.
    ExperimentId(i32),
    /// All records not yet in a terminal state.
    NonTerminal,
    /// Every record.
    All,
}

/// Persistence surface for experiment records.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Reserve the next experiment id. Serialized with `add`; ids are never
    /// reused.
    async fn next_experiment_id(&self) -> AppResult<i32>;

    /// Persist a new record.
    async fn add(&self, record: ExperimentRecord) -> AppResult<()>;

    /// Replace an existing record (status/result mutation).
    async fn update(&self, record: ExperimentRecord) -> AppResult<()>;

    /// Delete a record. Returns false when the id is unknown.
    async fn delete(&self, experiment_id: i32) -> AppResult<bool>;

    /// Retrieve records matching the criteria, in id order.
    async fn retrieve_by(&self, criteria: RetrieveBy) -> AppResult<Vec<ExperimentRecord>>;
}

#[derive(Default)]
struct MemoryStoreInner {
    next_id: i32,
    rows: BTreeMap<i32, ExperimentRecord>,
}

/// In-memory experiment store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    /// Empty store; the first reserved id is 1.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn next_experiment_id(&self) -> AppResult<i32> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        Ok(inner.next_id)
    }

    async fn add(&self, record: ExperimentRecord) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.rows.contains_key(&record.experiment_id) {
            return Err(LabError::Storage(format!(
                "duplicate experiment id {}",
                record.experiment_id
            )));
        }
        inner.rows.insert(record.experiment_id, record);
        Ok(())
    }

    async fn update(&self, record: ExperimentRecord) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.rows.contains_key(&record.experiment_id) {
            return Err(LabError::UnknownExperiment(record.experiment_id));
        }
        inner.rows.insert(record.experiment_id, record);
        Ok(())
    }

    async fn delete(&self, experiment_id: i32) -> AppResult<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.rows.remove(&experiment_id).is_some())
    }

    async fn retrieve_by(&self, criteria: RetrieveBy) -> AppResult<Vec<ExperimentRecord>> {
        let inner = self.inner.lock().await;
        let rows = inner.rows.values();
        Ok(match criteria {
            RetrieveBy::ExperimentId(id) => {
                rows.filter(|r| r.experiment_id == id).cloned().collect()
            }
            RetrieveBy::NonTerminal => rows
                .filter(|r| !r.status.is_terminal())
                .cloned()
                .collect(),
            RetrieveBy::All => rows.cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i32, status: StatusCode) -> ExperimentRecord {
        ExperimentRecord {
            experiment_id: id,
            lab_server_guid: "lab-1".to_string(),
            execution_id: None,
            status,
            estimated_runtime: 60.0,
            min_time_to_live: 14.0,
            submitted_at: Utc::now(),
            user_group: "students".to_string(),
            priority_hint: 0,
            cancel_requested: false,
            result: None,
        }
    }

    #[tokio::test]
    async fn test_ids_strictly_increase_and_survive_deletion() {
        let store = MemoryStore::new();
        let first = store.next_experiment_id().await.unwrap();
        store.add(record(first, StatusCode::Queued)).await.unwrap();
        assert!(store.delete(first).await.unwrap());
        // The id is never reused, even after deletion.
        let second = store.next_experiment_id().await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_concurrent_id_reservation_is_collision_free() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.next_experiment_id().await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 32);
    }

    #[tokio::test]
    async fn test_retrieve_by_non_terminal() {
        let store = MemoryStore::new();
        store.add(record(1, StatusCode::Queued)).await.unwrap();
        store.add(record(2, StatusCode::Completed)).await.unwrap();
        store.add(record(3, StatusCode::Running)).await.unwrap();
        let open = store.retrieve_by(RetrieveBy::NonTerminal).await.unwrap();
        let ids: Vec<i32> = open.iter().map(|r| r.experiment_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let store = MemoryStore::new();
        store.add(record(1, StatusCode::Queued)).await.unwrap();
        assert!(store.add(record(1, StatusCode::Queued)).await.is_err());
    }
}
