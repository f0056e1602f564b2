//! Record lifecycle and dispatch for pull-request events.
//!
//! One [`PullRequestOrchestrator`] is shared by every in-flight event. Runs
//! for different PRs proceed in parallel; deploy runs for the same PR are
//! serialized through [`DeployLocks`], and every record write goes through
//! the per-PR record lock in [`RecordStore`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::models::{Outcome, ProgressStep, PullRequestEvent, PullRequestRecord};
use super::monitor::ProcessMonitor;
use super::pipeline::DeploymentPipeline;
use super::progress::{CommentPublisher, ProgressPublisher};
use super::repository::Repository;
use super::router::{Action, EventKind, RouteContext, route};
use super::store::DeployLocks;
use super::store::RecordStore;
use super::supervisor::ProcessSupervisor;
use super::workspace;
use crate::config::DeploySection;
use crate::errors::DeployError;
use crate::util::find_in_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    /// Another run for the same PR held the lock.
    Skipped,
    Deployed { port: u16 },
}

pub struct PullRequestOrchestrator {
    store: RecordStore,
    comments: Arc<dyn CommentPublisher>,
    supervisor: Arc<dyn ProcessSupervisor>,
    settings: DeploySection,
    deploy_locks: DeployLocks,
    shutdown: CancellationToken,
}

impl PullRequestOrchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        comments: Arc<dyn CommentPublisher>,
        supervisor: Arc<dyn ProcessSupervisor>,
        settings: DeploySection,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store: RecordStore::new(repo),
            comments,
            supervisor,
            settings,
            deploy_locks: DeployLocks::default(),
            shutdown,
        }
    }

    /// Apply one event: update the record, route it, and run the resulting
    /// action to completion.
    pub async fn handle(&self, event: &PullRequestEvent) -> Result<Action, DeployError> {
        if !event.kind.is_handled() {
            info!(kind = %event.kind, "event accepted, not handled");
            return Ok(Action::Noop);
        }

        let (record, action) = {
            let _guard = self.store.lock(event.pr_id).await;
            let mut record = self.load_or_create(event).await?;
            let before = record.clone();

            record.refresh_from(event);
            match event.kind {
                EventKind::PullRequestOpened | EventKind::PullRequestReopened => {
                    record.active = true
                }
                EventKind::PullRequestClosed => record.active = false,
                EventKind::WorkflowRunCompleted => {
                    record.workflow_succeeded =
                        event.workflow_conclusion.as_deref() == Some("success");
                }
                _ => {}
            }

            let action = route(
                &event.kind,
                &RouteContext {
                    label: event.label.as_deref(),
                    deployment_label: &self.settings.deployment_label,
                    labeled_to_deploy: record.labeled_to_deploy,
                    workflow_succeeded: record.workflow_succeeded,
                },
            );
            info!(pr_id = record.pr_id, kind = %event.kind, ?action, "routing event");

            if action != Action::Noop || record != before {
                self.store.repository().save(&record).await?;
            }
            (record, action)
        };

        match action {
            Action::Noop | Action::EnsureRecord => {}
            Action::Deploy => {
                self.deploy(record).await?;
            }
            Action::Undeploy => self.undeploy(record).await?,
            Action::SetLabel(present) => {
                self.set_label(record, present).await?;
            }
        }
        Ok(action)
    }

    /// Load the record for the event's PR, creating and persisting a fresh
    /// one on first sight.
    pub async fn ensure_record(
        &self,
        event: &PullRequestEvent,
    ) -> Result<PullRequestRecord, DeployError> {
        let _guard = self.store.lock(event.pr_id).await;
        self.load_or_create(event).await
    }

    /// Caller holds the record lock.
    async fn load_or_create(
        &self,
        event: &PullRequestEvent,
    ) -> Result<PullRequestRecord, DeployError> {
        let repo = self.store.repository();
        if let Some(record) = repo.get_by_id(event.pr_id).await? {
            return Ok(record);
        }
        let record = PullRequestRecord::from_event(event);
        repo.save(&record).await?;
        info!(pr_id = record.pr_id, pr_number = record.pr_number, "new pull request record");
        Ok(record)
    }

    fn monitor_for(&self, pr_id: i64) -> ProcessMonitor {
        let publisher = ProgressPublisher::new(
            self.comments.clone(),
            self.store.clone(),
            self.settings.public_host.clone(),
        );
        ProcessMonitor::new(
            pr_id,
            publisher,
            self.shutdown.child_token(),
            self.settings.command_timeout(),
        )
    }

    pub fn workspace_path(&self, record: &PullRequestRecord) -> PathBuf {
        workspace::workspace_dir(&self.settings.builds_dir, record)
    }

    /// Recreate the PR's build directory from scratch.
    pub async fn ensure_workspace(
        &self,
        monitor: &ProcessMonitor,
        record: &mut PullRequestRecord,
    ) -> Result<PathBuf, DeployError> {
        monitor
            .report(record, ProgressStep::PreparingWorkspace, Outcome::Ongoing)
            .await?;
        let dir = self.workspace_path(record);
        if let Err(e) = workspace::prepare(&dir).await {
            warn!(pr_id = record.pr_id, error = %e, "workspace preparation failed");
            monitor
                .report_failure(record, ProgressStep::PreparingWorkspace)
                .await;
            return Err(e);
        }
        monitor
            .report(record, ProgressStep::PreparingWorkspace, Outcome::Succeeded)
            .await?;
        Ok(dir)
    }

    fn clone_command(&self, git: &Path, record: &PullRequestRecord, dir: &Path) -> Command {
        let mut cmd = Command::new(git);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        let address = match &self.settings.ssh_key_path {
            Some(key) if !record.ssh_address.is_empty() => {
                cmd.env(
                    "GIT_SSH_COMMAND",
                    format!(
                        "ssh -i {} -o IdentitiesOnly=yes -F /dev/null",
                        key.display()
                    ),
                );
                &record.ssh_address
            }
            _ => &record.repo_address,
        };
        cmd.arg("clone")
            .arg("-b")
            .arg(&record.branch_name)
            .arg("--single-branch")
            .arg(address)
            .arg(dir);
        cmd
    }

    /// Clone the PR branch into `dir`.
    pub async fn pull_changes(
        &self,
        monitor: &ProcessMonitor,
        record: &mut PullRequestRecord,
        dir: &Path,
    ) -> Result<(), DeployError> {
        let Some(git) = find_in_path(&self.settings.git_command) else {
            monitor.report_failure(record, ProgressStep::Started).await;
            return Err(DeployError::ToolMissing {
                tool: self.settings.git_command.clone(),
            });
        };

        monitor
            .report(record, ProgressStep::PullingChanges, Outcome::Ongoing)
            .await?;
        monitor.add_log(format!("cloning {} into {}", record.branch_name, dir.display()));

        let cmd = self.clone_command(&git, record, dir);
        if let Err(source) = monitor.run(cmd).await {
            monitor
                .report_failure(record, ProgressStep::PullingChanges)
                .await;
            return Err(DeployError::Clone {
                branch: record.branch_name.clone(),
                source,
            });
        }

        // Pick up changes other events made while the clone ran.
        *record = self.store.update(record, |_| {}).await?;
        monitor
            .report(record, ProgressStep::PullingChanges, Outcome::Succeeded)
            .await?;
        Ok(())
    }

    /// Run the full pipeline for `record`, unless a run for the same PR is
    /// already in progress.
    pub async fn deploy(&self, record: PullRequestRecord) -> Result<DeployOutcome, DeployError> {
        let pr_id = record.pr_id;
        let Some(_guard) = self.deploy_locks.try_acquire(pr_id) else {
            info!(pr_id, "deployment already in progress, skipping");
            return Ok(DeployOutcome::Skipped);
        };

        let mut record = self
            .store
            .update(&record, |r| {
                if r.is_deploying {
                    warn!(pr_id, "stale is_deploying flag found with no run in progress, overriding");
                }
                r.is_deploying = true;
            })
            .await?;

        let monitor = self.monitor_for(pr_id);
        match self.run_deploy(&monitor, &mut record).await {
            Ok(port) => Ok(DeployOutcome::Deployed { port }),
            Err(e) => {
                if let Err(save_err) = self.store.update(&record, |r| r.is_deploying = false).await
                {
                    warn!(pr_id, error = %save_err, "failed to clear is_deploying after failure");
                }
                Err(e)
            }
        }
    }

    async fn run_deploy(
        &self,
        monitor: &ProcessMonitor,
        record: &mut PullRequestRecord,
    ) -> Result<u16, DeployError> {
        monitor
            .report(record, ProgressStep::Started, Outcome::Ongoing)
            .await?;
        monitor
            .report(record, ProgressStep::Started, Outcome::Succeeded)
            .await?;

        let dir = self.ensure_workspace(monitor, record).await?;
        self.pull_changes(monitor, record, &dir).await?;

        let pipeline = DeploymentPipeline::new(
            monitor,
            &self.store,
            self.supervisor.as_ref(),
            &self.settings,
        );
        pipeline.deploy(record, &dir).await
    }

    /// Tear down a running deployment. Waits for any in-flight run for the
    /// same PR to finish first.
    pub async fn undeploy(&self, record: PullRequestRecord) -> Result<(), DeployError> {
        let pr_id = record.pr_id;
        let _guard = self.deploy_locks.acquire(pr_id).await;

        let mut record = self
            .store
            .repository()
            .get_by_id(pr_id)
            .await?
            .unwrap_or(record);
        if !record.deployed {
            return Err(DeployError::NotDeployed { pr_id });
        }

        let monitor = self.monitor_for(pr_id);
        let dir = self.workspace_path(&record);
        if let Err(e) = workspace::remove(&dir).await {
            monitor
                .report_failure(&mut record, ProgressStep::Undeploying)
                .await;
            return Err(e);
        }

        DeploymentPipeline::new(
            &monitor,
            &self.store,
            self.supervisor.as_ref(),
            &self.settings,
        )
        .undeploy(&mut record)
        .await
    }

    /// Record whether the deployment label is present; adding it deploys a
    /// PR that is not yet running. Removing it leaves any deployment up.
    pub async fn set_label(
        &self,
        record: PullRequestRecord,
        present: bool,
    ) -> Result<Option<DeployOutcome>, DeployError> {
        let record = self
            .store
            .update(&record, |r| r.labeled_to_deploy = present)
            .await?;
        info!(pr_id = record.pr_id, present, "deployment label updated");

        if present && !record.deployed {
            return self.deploy(record).await.map(Some);
        }
        Ok(None)
    }
}
