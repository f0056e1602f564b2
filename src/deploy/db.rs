use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, Row, params};

use super::models::PullRequestRecord;
use super::repository::Repository;
use crate::errors::RepositoryError;

const RECORD_COLUMNS: &str = "pr_id, pr_number, pr_url, branch_name, repo_name, repo_address, \
     ssh_address, installation_id, owner_name, owner_id, comment_id, workflow_succeeded, \
     labeled_to_deploy, active, is_deploying, deployed, deployment_port";

/// Async-safe SQLite repository.
///
/// Wraps `DeployDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct SqliteRepository {
    inner: Arc<std::sync::Mutex<DeployDb>>,
}

impl SqliteRepository {
    pub fn new(db: DeployDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(DeployDb::new(path)?))
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&DeployDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn get_by_id(&self, pr_id: i64) -> Result<Option<PullRequestRecord>, RepositoryError> {
        self.call(move |db| db.get_record(pr_id))
            .await
            .map_err(RepositoryError::Storage)
    }

    async fn save(&self, record: &PullRequestRecord) -> Result<(), RepositoryError> {
        let record = record.clone();
        self.call(move |db| db.upsert_record(&record))
            .await
            .map_err(RepositoryError::Storage)
    }

    async fn list(&self) -> Result<Vec<PullRequestRecord>, RepositoryError> {
        self.call(|db| db.list_records())
            .await
            .map_err(RepositoryError::Storage)
    }
}

pub struct DeployDb {
    conn: Connection,
}

impl DeployDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS pull_requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    pr_id INTEGER NOT NULL UNIQUE,
                    pr_number INTEGER NOT NULL,
                    pr_url TEXT NOT NULL DEFAULT '',
                    branch_name TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    repo_address TEXT NOT NULL,
                    ssh_address TEXT NOT NULL DEFAULT '',
                    installation_id INTEGER NOT NULL,
                    owner_name TEXT NOT NULL,
                    owner_id INTEGER NOT NULL,
                    comment_id INTEGER NOT NULL DEFAULT 0,
                    workflow_succeeded INTEGER NOT NULL DEFAULT 0,
                    labeled_to_deploy INTEGER NOT NULL DEFAULT 0,
                    active INTEGER NOT NULL DEFAULT 0,
                    is_deploying INTEGER NOT NULL DEFAULT 0,
                    deployed INTEGER NOT NULL DEFAULT 0,
                    deployment_port INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );
                ",
            )
            .context("Failed to create pull_requests table")?;
        Ok(())
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<PullRequestRecord> {
        Ok(PullRequestRecord {
            pr_id: row.get(0)?,
            pr_number: row.get(1)?,
            pr_url: row.get(2)?,
            branch_name: row.get(3)?,
            repo_name: row.get(4)?,
            repo_address: row.get(5)?,
            ssh_address: row.get(6)?,
            installation_id: row.get(7)?,
            owner_name: row.get(8)?,
            owner_id: row.get(9)?,
            comment_id: row.get(10)?,
            workflow_succeeded: row.get(11)?,
            labeled_to_deploy: row.get(12)?,
            active: row.get(13)?,
            is_deploying: row.get(14)?,
            deployed: row.get(15)?,
            deployment_port: row.get(16)?,
        })
    }

    pub fn get_record(&self, pr_id: i64) -> Result<Option<PullRequestRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM pull_requests WHERE pr_id = ?1",
                RECORD_COLUMNS
            ))
            .context("Failed to prepare get_record")?;
        let mut rows = stmt
            .query_map(params![pr_id], Self::row_to_record)
            .context("Failed to query pull request")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read pull request row")?)),
            None => Ok(None),
        }
    }

    pub fn list_records(&self) -> Result<Vec<PullRequestRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM pull_requests ORDER BY pr_id",
                RECORD_COLUMNS
            ))
            .context("Failed to prepare list_records")?;
        let rows = stmt
            .query_map([], Self::row_to_record)
            .context("Failed to query pull requests")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read pull request rows")
    }

    /// Insert the record, or update every mutable column of the existing row
    /// with the same `pr_id`.
    pub fn upsert_record(&self, r: &PullRequestRecord) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO pull_requests ({})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                     ON CONFLICT(pr_id) DO UPDATE SET
                        pr_number = excluded.pr_number,
                        pr_url = excluded.pr_url,
                        branch_name = excluded.branch_name,
                        repo_name = excluded.repo_name,
                        repo_address = excluded.repo_address,
                        ssh_address = excluded.ssh_address,
                        installation_id = excluded.installation_id,
                        owner_name = excluded.owner_name,
                        owner_id = excluded.owner_id,
                        comment_id = excluded.comment_id,
                        workflow_succeeded = excluded.workflow_succeeded,
                        labeled_to_deploy = excluded.labeled_to_deploy,
                        active = excluded.active,
                        is_deploying = excluded.is_deploying,
                        deployed = excluded.deployed,
                        deployment_port = excluded.deployment_port,
                        updated_at = datetime('now')",
                    RECORD_COLUMNS
                ),
                params![
                    r.pr_id,
                    r.pr_number,
                    r.pr_url,
                    r.branch_name,
                    r.repo_name,
                    r.repo_address,
                    r.ssh_address,
                    r.installation_id,
                    r.owner_name,
                    r.owner_id,
                    r.comment_id,
                    r.workflow_succeeded,
                    r.labeled_to_deploy,
                    r.active,
                    r.is_deploying,
                    r.deployed,
                    r.deployment_port,
                ],
            )
            .with_context(|| format!("Failed to upsert pull request {}", r.pr_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pr_id: i64) -> PullRequestRecord {
        PullRequestRecord {
            pr_id,
            pr_number: 7,
            pr_url: "https://api.github.com/repos/acme/web/pulls/7".into(),
            branch_name: "feature/x".into(),
            repo_name: "web".into(),
            repo_address: "https://github.com/acme/web".into(),
            ssh_address: "git@github.com:acme/web.git".into(),
            installation_id: 1234,
            owner_name: "acme".into(),
            owner_id: 99,
            active: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_get_missing_record() -> Result<()> {
        let db = DeployDb::new_in_memory()?;
        assert!(db.get_record(1)?.is_none());
        Ok(())
    }

    #[test]
    fn test_upsert_inserts_then_updates_same_row() -> Result<()> {
        let db = DeployDb::new_in_memory()?;
        let mut r = record(42);
        db.upsert_record(&r)?;

        r.comment_id = 1001;
        r.labeled_to_deploy = true;
        r.mark_deployed(41234);
        db.upsert_record(&r)?;

        let all = db.list_records()?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], r);
        Ok(())
    }

    #[test]
    fn test_round_trips_every_field() -> Result<()> {
        let db = DeployDb::new_in_memory()?;
        let mut r = record(7);
        r.workflow_succeeded = true;
        r.is_deploying = true;
        db.upsert_record(&r)?;
        assert_eq!(db.get_record(7)?, Some(r));
        Ok(())
    }

    #[test]
    fn test_file_database_persists_and_creates_parent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("state.db");
        {
            let db = DeployDb::new(&path)?;
            db.upsert_record(&record(3))?;
        }
        let db = DeployDb::new(&path)?;
        assert_eq!(db.get_record(3)?.map(|r| r.branch_name), Some("feature/x".into()));
        Ok(())
    }

    #[tokio::test]
    async fn test_repository_port_over_sqlite() -> Result<()> {
        let repo = SqliteRepository::new(DeployDb::new_in_memory()?);
        repo.save(&record(2)).await?;
        repo.save(&record(1)).await?;
        let mut r = repo.get_by_id(2).await?.expect("record 2");
        r.active = false;
        repo.save(&r).await?;

        let all = repo.list().await?;
        assert_eq!(all.iter().map(|r| r.pr_id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(!all[1].active);
        Ok(())
    }
}
