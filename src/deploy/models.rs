use std::fmt;

use serde::{Deserialize, Serialize};

use super::router::EventKind;

/// A normalized pull-request event, produced by the webhook layer.
///
/// `pr_id` is the stable identity used for persistence; `pr_number` is only
/// shown to humans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestEvent {
    pub kind: EventKind,
    pub branch_name: String,
    pub pr_id: i64,
    pub pr_number: i64,
    pub pr_url: String,
    pub repo_name: String,
    pub repo_address: String,
    pub ssh_address: String,
    pub owner_name: String,
    pub owner_id: i64,
    pub installation_id: i64,
    pub label: Option<String>,
    pub workflow_conclusion: Option<String>,
}

/// The persisted state of one pull request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub pr_id: i64,
    pub pr_number: i64,
    pub pr_url: String,
    pub branch_name: String,
    pub repo_name: String,
    pub repo_address: String,
    pub ssh_address: String,
    pub installation_id: i64,
    pub owner_name: String,
    pub owner_id: i64,
    /// 0 until the status comment is created.
    pub comment_id: i64,
    pub workflow_succeeded: bool,
    pub labeled_to_deploy: bool,
    pub active: bool,
    pub is_deploying: bool,
    pub deployed: bool,
    /// Non-zero only while `deployed`.
    pub deployment_port: u16,
}

impl PullRequestRecord {
    /// A fresh record for a PR seen for the first time.
    pub fn from_event(event: &PullRequestEvent) -> Self {
        let mut record = Self {
            pr_id: event.pr_id,
            ..Self::default()
        };
        record.refresh_from(event);
        record
    }

    /// Copy the descriptive fields of `event` onto this record. Identity,
    /// comment correlation and lifecycle flags are left untouched.
    pub fn refresh_from(&mut self, event: &PullRequestEvent) {
        self.pr_number = event.pr_number;
        self.pr_url = event.pr_url.clone();
        self.branch_name = event.branch_name.clone();
        self.repo_name = event.repo_name.clone();
        self.repo_address = event.repo_address.clone();
        self.ssh_address = event.ssh_address.clone();
        self.installation_id = event.installation_id;
        self.owner_name = event.owner_name.clone();
        self.owner_id = event.owner_id;
    }

    /// Mark a supervised process as running on `port`.
    pub fn mark_deployed(&mut self, port: u16) {
        self.deployed = true;
        self.deployment_port = port;
        self.is_deploying = false;
    }

    pub fn mark_undeployed(&mut self) {
        self.deployed = false;
        self.deployment_port = 0;
        self.is_deploying = false;
    }

    /// Name under which the process supervisor knows this PR's process.
    pub fn process_name(&self) -> String {
        self.pr_id.to_string()
    }

    pub fn port_invariant_holds(&self) -> bool {
        (self.deployment_port != 0) == self.deployed
    }
}

/// Steps of a deployment, in the order they are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
    Started,
    PreparingWorkspace,
    PullingChanges,
    InstallingDependencies,
    Building,
    Deploying,
    Completed,
    Undeploying,
}

impl ProgressStep {
    /// The checklist steps of a deployment, `Started` through `Completed`.
    pub const DEPLOY_STEPS: [ProgressStep; 7] = [
        Self::Started,
        Self::PreparingWorkspace,
        Self::PullingChanges,
        Self::InstallingDependencies,
        Self::Building,
        Self::Deploying,
        Self::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::PreparingWorkspace => "preparing_workspace",
            Self::PullingChanges => "pulling_changes",
            Self::InstallingDependencies => "installing_dependencies",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Completed => "completed",
            Self::Undeploying => "undeploying",
        }
    }

    /// Human-readable checklist label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Started => "Started",
            Self::PreparingWorkspace => "Preparing workspace",
            Self::PullingChanges => "Pulling changes",
            Self::InstallingDependencies => "Installing dependencies",
            Self::Building => "Building",
            Self::Deploying => "Deploying",
            Self::Completed => "Completed",
            Self::Undeploying => "Undeploying",
        }
    }
}

impl fmt::Display for ProgressStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    NotYet,
    Ongoing,
    Succeeded,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotYet => "not_yet",
            Self::Ongoing => "ongoing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
