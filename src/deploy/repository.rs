//! Persistence port for pull-request records.
//!
//! The orchestrator only needs keyed reads and upserts. Two implementations
//! exist: [`InMemoryRepository`] here, and `SqliteRepository` in
//! [`super::db`].

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::models::PullRequestRecord;
use crate::errors::RepositoryError;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Look up a record by its stable PR id.
    async fn get_by_id(&self, pr_id: i64) -> Result<Option<PullRequestRecord>, RepositoryError>;

    /// Insert or update the record keyed by `record.pr_id`.
    async fn save(&self, record: &PullRequestRecord) -> Result<(), RepositoryError>;

    /// Every stored record, ordered by PR id.
    async fn list(&self) -> Result<Vec<PullRequestRecord>, RepositoryError>;
}

/// Records held in a `HashMap`; lost on restart.
#[derive(Default)]
pub struct InMemoryRepository {
    records: RwLock<HashMap<i64, PullRequestRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_by_id(&self, pr_id: i64) -> Result<Option<PullRequestRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&pr_id).cloned())
    }

    async fn save(&self, record: &PullRequestRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        records.insert(record.pr_id, record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PullRequestRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by_key(|r| r.pr_id);
        Ok(all)
    }
}
