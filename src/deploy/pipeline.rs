//! Install, build and run stages for one pull request.
//!
//! Stages are fail-fast: the first failure is reported on the status comment
//! and returned, and later stages are not attempted. Nothing already done is
//! rolled back.

use std::path::Path;

use tokio::process::Command;
use tracing::{error, info, warn};

use super::models::{Outcome, ProgressStep, PullRequestRecord};
use super::monitor::ProcessMonitor;
use super::store::RecordStore;
use super::supervisor::{ProcessSpec, ProcessSupervisor, allocate_port};
use crate::config::DeploySection;
use crate::errors::{CommandError, DeployError};

/// Lines of captured output attached to a failure log.
const FAILURE_TAIL_LINES: usize = 20;

pub struct DeploymentPipeline<'a> {
    monitor: &'a ProcessMonitor,
    store: &'a RecordStore,
    supervisor: &'a dyn ProcessSupervisor,
    settings: &'a DeploySection,
}

impl<'a> DeploymentPipeline<'a> {
    pub fn new(
        monitor: &'a ProcessMonitor,
        store: &'a RecordStore,
        supervisor: &'a dyn ProcessSupervisor,
        settings: &'a DeploySection,
    ) -> Self {
        Self {
            monitor,
            store,
            supervisor,
            settings,
        }
    }

    /// Install, build, then start or restart. Returns the serving port.
    pub async fn deploy(
        &self,
        record: &mut PullRequestRecord,
        work_dir: &Path,
    ) -> Result<u16, DeployError> {
        self.install(record, work_dir).await?;
        self.build(record, work_dir).await?;
        self.run(record, work_dir).await
    }

    pub async fn install(
        &self,
        record: &mut PullRequestRecord,
        work_dir: &Path,
    ) -> Result<(), DeployError> {
        self.shell_stage(
            record,
            work_dir,
            ProgressStep::InstallingDependencies,
            &self.settings.install_command,
        )
        .await
    }

    pub async fn build(
        &self,
        record: &mut PullRequestRecord,
        work_dir: &Path,
    ) -> Result<(), DeployError> {
        self.shell_stage(
            record,
            work_dir,
            ProgressStep::Building,
            &self.settings.build_command,
        )
        .await
    }

    async fn shell_stage(
        &self,
        record: &mut PullRequestRecord,
        work_dir: &Path,
        step: ProgressStep,
        command: &str,
    ) -> Result<(), DeployError> {
        self.monitor.report(record, step, Outcome::Ongoing).await?;
        self.monitor.add_log(format!("$ {}", command));
        let mark = self.output_mark().await;

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(work_dir);

        match self.monitor.run(cmd).await {
            Ok(()) => self.monitor.report(record, step, Outcome::Succeeded).await,
            Err(e) => {
                self.log_failure(step, &e.to_string(), mark);
                self.monitor.report_failure(record, step).await;
                Err(stage_error(step, e))
            }
        }
    }

    /// Start the build under the supervisor, reusing the current port on
    /// redeploy.
    pub async fn run(
        &self,
        record: &mut PullRequestRecord,
        work_dir: &Path,
    ) -> Result<u16, DeployError> {
        self.monitor
            .report(record, ProgressStep::Deploying, Outcome::Ongoing)
            .await?;
        let mark = self.output_mark().await;

        let port = match self.start_or_restart(record, work_dir).await {
            Ok(port) => port,
            Err(e) => {
                self.log_failure(ProgressStep::Deploying, &format!("{:#}", e), mark);
                self.monitor
                    .report_failure(record, ProgressStep::Deploying)
                    .await;
                return Err(DeployError::Deploy(e));
            }
        };

        *record = self.store.update(record, |r| r.mark_deployed(port)).await?;
        info!(pr_id = record.pr_id, port, "deployed");
        self.monitor
            .report(record, ProgressStep::Deploying, Outcome::Succeeded)
            .await?;
        self.monitor
            .report(record, ProgressStep::Completed, Outcome::Succeeded)
            .await?;
        Ok(port)
    }

    async fn start_or_restart(
        &self,
        record: &PullRequestRecord,
        work_dir: &Path,
    ) -> anyhow::Result<u16> {
        let port = if record.deployed && record.deployment_port != 0 {
            record.deployment_port
        } else {
            allocate_port()?
        };
        let spec = ProcessSpec {
            name: record.process_name(),
            work_dir: work_dir.to_path_buf(),
            env: vec![("PORT".to_string(), port.to_string())],
            run_command: self.settings.run_command.clone(),
        };
        self.monitor
            .add_log(format!("starting `{}` as {} on port {}", spec.run_command, spec.name, port));
        self.supervisor.start_or_restart(&spec).await?;
        Ok(port)
    }

    /// Stop the supervised process and clear the deployment from the record.
    pub async fn undeploy(&self, record: &mut PullRequestRecord) -> Result<(), DeployError> {
        self.monitor
            .report(record, ProgressStep::Undeploying, Outcome::Ongoing)
            .await?;
        let mark = self.output_mark().await;

        let name = record.process_name();
        let stopped = match self.supervisor.exists(&name).await {
            Ok(true) => self.supervisor.stop(&name).await,
            Ok(false) => Err(anyhow::anyhow!("no supervised process named {}", name)),
            Err(e) => Err(e),
        };
        if let Err(e) = stopped {
            self.log_failure(ProgressStep::Undeploying, &format!("{:#}", e), mark);
            self.monitor
                .report_failure(record, ProgressStep::Undeploying)
                .await;
            return Err(DeployError::Deploy(e));
        }

        *record = self.store.update(record, |r| r.mark_undeployed()).await?;
        info!(pr_id = record.pr_id, "undeployed");
        self.monitor
            .report(record, ProgressStep::Undeploying, Outcome::Succeeded)
            .await
    }

    /// Position in the monitor's output after everything queued so far.
    async fn output_mark(&self) -> u64 {
        self.monitor.flush().await;
        self.monitor.line_count()
    }

    /// The last lines a stage printed after `mark`.
    fn failure_output(&self, mark: u64) -> Vec<String> {
        let mut output = self.monitor.output_since(mark);
        let start = output.len().saturating_sub(FAILURE_TAIL_LINES);
        output.split_off(start)
    }

    fn log_failure(&self, step: ProgressStep, reason: &str, mark: u64) {
        let output = self.failure_output(mark);
        error!(
            pr_id = self.monitor.pr_id(),
            %step,
            reason,
            output = %output.join("\n"),
            "stage failed"
        );
        if output.is_empty() {
            warn!(pr_id = self.monitor.pr_id(), %step, "stage produced no output");
        }
    }
}

fn stage_error(step: ProgressStep, e: CommandError) -> DeployError {
    match step {
        ProgressStep::InstallingDependencies => DeployError::Install(e),
        _ => DeployError::Build(e),
    }
}
