//! Serialized read-modify-write access to pull-request records.
//!
//! Every writer (event handling, the pipeline, the progress publisher) goes
//! through [`RecordStore::update`], which re-reads the stored row under a
//! per-PR mutex, applies only the caller's change, and saves it. A writer
//! never saves a copy it loaded earlier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use super::models::PullRequestRecord;
use super::repository::Repository;
use crate::errors::DeployError;

/// Per-PR async mutexes, created on first use.
#[derive(Default)]
pub struct DeployLocks {
    inner: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeployLocks {
    fn entry(&self, pr_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(pr_id).or_default().clone()
    }

    /// The lock for `pr_id`, or `None` if someone already holds it.
    pub fn try_acquire(&self, pr_id: i64) -> Option<OwnedMutexGuard<()>> {
        self.entry(pr_id).try_lock_owned().ok()
    }

    pub async fn acquire(&self, pr_id: i64) -> OwnedMutexGuard<()> {
        self.entry(pr_id).lock_owned().await
    }
}

#[derive(Clone)]
pub struct RecordStore {
    repo: Arc<dyn Repository>,
    locks: Arc<DeployLocks>,
}

impl RecordStore {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            locks: Arc::new(DeployLocks::default()),
        }
    }

    pub fn repository(&self) -> &dyn Repository {
        self.repo.as_ref()
    }

    /// Hold the record lock for `pr_id`. Reads and saves made through
    /// [`repository`](Self::repository) while holding it are atomic with
    /// respect to [`update`](Self::update).
    pub async fn lock(&self, pr_id: i64) -> OwnedMutexGuard<()> {
        self.locks.acquire(pr_id).await
    }

    /// Apply `change` to the stored record (or to `fallback` when none is
    /// stored yet), save it, and return the result.
    pub async fn update<F>(
        &self,
        fallback: &PullRequestRecord,
        change: F,
    ) -> Result<PullRequestRecord, DeployError>
    where
        F: FnOnce(&mut PullRequestRecord),
    {
        let _guard = self.lock(fallback.pr_id).await;
        let mut record = self
            .repo
            .get_by_id(fallback.pr_id)
            .await?
            .unwrap_or_else(|| fallback.clone());
        change(&mut record);
        self.repo.save(&record).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::repository::InMemoryRepository;
    use crate::deploy::test_support::FailingRepository;

    fn record() -> PullRequestRecord {
        PullRequestRecord {
            pr_id: 42,
            pr_number: 7,
            ..Default::default()
        }
    }

    #[test]
    fn test_try_acquire_is_exclusive_per_pr() {
        let locks = DeployLocks::default();
        let held = locks.try_acquire(1).unwrap();
        assert!(locks.try_acquire(1).is_none());
        assert!(locks.try_acquire(2).is_some());
        drop(held);
        assert!(locks.try_acquire(1).is_some());
    }

    #[tokio::test]
    async fn test_update_keeps_fields_written_by_others() {
        let repo = Arc::new(InMemoryRepository::new());
        let store = RecordStore::new(repo.clone());
        let stale = record();

        store.update(&stale, |r| r.comment_id = 1000).await.unwrap();
        let updated = store.update(&stale, |r| r.mark_deployed(4100)).await.unwrap();

        assert_eq!(updated.comment_id, 1000);
        assert_eq!(updated.deployment_port, 4100);
        assert_eq!(repo.get_by_id(42).await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn test_update_waits_for_lock_holder() {
        let store = RecordStore::new(Arc::new(InMemoryRepository::new()));
        let guard = store.lock(42).await;

        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.update(&record(), |r| r.active = true).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        drop(guard);
        assert!(writer.await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_update_surfaces_save_failure() {
        let repo = Arc::new(FailingRepository::failing_when(|r| r.deployed));
        let store = RecordStore::new(repo);
        let err = store.update(&record(), |r| r.mark_deployed(1)).await.unwrap_err();
        assert!(matches!(err, DeployError::Persistence(_)));
    }
}
