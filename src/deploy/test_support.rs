//! Fakes for the deploy ports, shared by unit tests.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

use super::models::{PullRequestEvent, PullRequestRecord};
use super::progress::{CommentPublisher, CommentTarget};
use super::repository::{InMemoryRepository, Repository};
use super::router::EventKind;
use super::supervisor::{ProcessSpec, ProcessSupervisor};
use crate::errors::RepositoryError;

pub fn sample_event(kind: EventKind) -> PullRequestEvent {
    PullRequestEvent {
        kind,
        branch_name: "feature/x".into(),
        pr_id: 42,
        pr_number: 7,
        pr_url: "https://api.github.com/repos/acme/web/pulls/7".into(),
        repo_name: "web".into(),
        repo_address: "https://github.com/acme/web".into(),
        ssh_address: "git@github.com:acme/web.git".into(),
        owner_name: "acme".into(),
        owner_id: 99,
        installation_id: 1234,
        label: None,
        workflow_conclusion: None,
    }
}

/// Records every comment call; ids start at 1000.
pub struct FakeComments {
    next_id: AtomicI64,
    creates: AtomicUsize,
    edits: AtomicUsize,
    bodies: Mutex<Vec<String>>,
    fail: bool,
}

impl Default for FakeComments {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(1000),
            creates: AtomicUsize::new(0),
            edits: AtomicUsize::new(0),
            bodies: Mutex::new(Vec::new()),
            fail: false,
        }
    }
}

impl FakeComments {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn edited(&self) -> usize {
        self.edits.load(Ordering::SeqCst)
    }

    pub fn last_body(&self) -> String {
        self.bodies.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl CommentPublisher for FakeComments {
    async fn create(&self, _target: &CommentTarget, body: &str) -> Result<i64> {
        if self.fail {
            bail!("GitHub API returned 502");
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().unwrap().push(body.to_string());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn edit(&self, _target: &CommentTarget, comment_id: i64, body: &str) -> Result<i64> {
        if self.fail {
            bail!("GitHub API returned 502");
        }
        self.edits.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().unwrap().push(body.to_string());
        Ok(comment_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCall {
    Start(ProcessSpec),
    Restart(ProcessSpec),
    Stop(String),
}

/// In-memory process table. `fail_next` makes the next mutating call fail.
#[derive(Default)]
pub struct FakeSupervisor {
    running: Mutex<HashSet<String>>,
    calls: Mutex<Vec<SupervisorCall>>,
    fail: Mutex<Option<String>>,
}

impl FakeSupervisor {
    pub fn add_running(&self, name: &str) {
        self.running.lock().unwrap().insert(name.to_string());
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.lock().unwrap().contains(name)
    }

    pub fn fail_next(&self, reason: &str) {
        *self.fail.lock().unwrap() = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<SupervisorCall> {
        self.calls.lock().unwrap().clone()
    }

    fn check_failure(&self) -> Result<()> {
        if let Some(reason) = self.fail.lock().unwrap().take() {
            bail!(reason);
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.is_running(name))
    }

    async fn start(&self, spec: &ProcessSpec) -> Result<()> {
        self.check_failure()?;
        self.calls.lock().unwrap().push(SupervisorCall::Start(spec.clone()));
        self.add_running(&spec.name);
        Ok(())
    }

    async fn restart(&self, spec: &ProcessSpec) -> Result<()> {
        self.check_failure()?;
        self.calls.lock().unwrap().push(SupervisorCall::Restart(spec.clone()));
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.check_failure()?;
        self.calls.lock().unwrap().push(SupervisorCall::Stop(name.to_string()));
        self.running.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Write an executable shell script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A stand-in `git` whose `clone` creates the target directory with a
/// `package.json`, and logs its arguments and `GIT_SSH_COMMAND` to
/// `<dir>/git.log`.
pub fn fake_git(dir: &Path) -> PathBuf {
    let log = dir.join("git.log");
    write_script(
        dir,
        "git",
        &format!(
            r#"echo "$* | $GIT_SSH_COMMAND" >> {log}
for last; do :; done
mkdir -p "$last" && echo '{{}}' > "$last/package.json"
echo "Cloning into '$last'..." >&2"#,
            log = log.display()
        ),
    )
}

/// A stand-in `git` that always fails.
pub fn failing_git(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "git",
        "echo \"fatal: Remote branch not found in upstream origin\" >&2\nexit 128",
    )
}

/// In-memory repository whose `save` fails for records matching a predicate.
pub struct FailingRepository {
    inner: InMemoryRepository,
    fail_when: Box<dyn Fn(&PullRequestRecord) -> bool + Send + Sync>,
    failures: AtomicUsize,
}

impl FailingRepository {
    pub fn failing_when(
        predicate: impl Fn(&PullRequestRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: InMemoryRepository::new(),
            fail_when: Box::new(predicate),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repository for FailingRepository {
    async fn get_by_id(&self, pr_id: i64) -> Result<Option<PullRequestRecord>, RepositoryError> {
        self.inner.get_by_id(pr_id).await
    }

    async fn save(&self, record: &PullRequestRecord) -> Result<(), RepositoryError> {
        if (self.fail_when)(record) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(RepositoryError::Storage(anyhow!("database is locked")));
        }
        self.inner.save(record).await
    }

    async fn list(&self) -> Result<Vec<PullRequestRecord>, RepositoryError> {
        self.inner.list().await
    }
}

/// In-memory repository where the next read, once armed, takes its snapshot
/// and then waits before returning it.
#[derive(Default)]
pub struct SlowReadRepository {
    inner: InMemoryRepository,
    delay: Mutex<Option<Duration>>,
}

impl SlowReadRepository {
    pub fn delay_next_read(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl Repository for SlowReadRepository {
    async fn get_by_id(&self, pr_id: i64) -> Result<Option<PullRequestRecord>, RepositoryError> {
        let snapshot = self.inner.get_by_id(pr_id).await?;
        let delay = self.delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(snapshot)
    }

    async fn save(&self, record: &PullRequestRecord) -> Result<(), RepositoryError> {
        self.inner.save(record).await
    }

    async fn list(&self) -> Result<Vec<PullRequestRecord>, RepositoryError> {
        self.inner.list().await
    }
}
