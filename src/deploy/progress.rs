//! Markdown rendering of deployment progress and the single-comment upsert.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::models::{Outcome, ProgressStep, PullRequestRecord};
use super::store::RecordStore;
use crate::errors::DeployError;

/// Where a status comment lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentTarget {
    pub installation_id: i64,
    pub owner: String,
    pub repo: String,
    pub pr_number: i64,
}

impl CommentTarget {
    pub fn for_record(record: &PullRequestRecord) -> Self {
        Self {
            installation_id: record.installation_id,
            owner: record.owner_name.clone(),
            repo: record.repo_name.clone(),
            pr_number: record.pr_number,
        }
    }
}

/// Remote issue-comment API.
#[async_trait]
pub trait CommentPublisher: Send + Sync {
    /// Create a comment and return its id.
    async fn create(&self, target: &CommentTarget, body: &str) -> anyhow::Result<i64>;

    /// Replace the body of an existing comment and return its id.
    async fn edit(&self, target: &CommentTarget, comment_id: i64, body: &str)
    -> anyhow::Result<i64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBadge {
    Deploying,
    Deployed,
    Failed,
    Undeployed,
}

impl StatusBadge {
    pub fn for_state(step: ProgressStep, outcome: Outcome) -> Self {
        let deployed = step == ProgressStep::Completed
            || (step == ProgressStep::Deploying && outcome == Outcome::Succeeded);
        if deployed {
            Self::Deployed
        } else if outcome == Outcome::Failed {
            Self::Failed
        } else if step == ProgressStep::Undeploying && outcome == Outcome::Succeeded {
            Self::Undeployed
        } else {
            Self::Deploying
        }
    }

    fn markdown(&self) -> &'static str {
        match self {
            Self::Deploying => "![Deploying](https://img.shields.io/badge/status-Deploying-yellow)",
            Self::Deployed => "![Deployed](https://img.shields.io/badge/status-Deployed-green)",
            Self::Failed => "![Failed](https://img.shields.io/badge/status-Failed-red)",
            Self::Undeployed => "![Undeployed](https://img.shields.io/badge/status-Undeployed-yellow)",
        }
    }
}

fn marker(step: ProgressStep, current: ProgressStep, outcome: Outcome) -> &'static str {
    if step < current {
        return "✅";
    }
    if step > current {
        return "⚪";
    }
    match outcome {
        Outcome::Succeeded => "✅",
        Outcome::Ongoing => "⏳",
        Outcome::Failed => "❌",
        Outcome::NotYet => "⚪",
    }
}

/// Render the full comment body for `record` at `step`/`outcome`.
pub fn render(
    record: &PullRequestRecord,
    step: ProgressStep,
    outcome: Outcome,
    public_host: &str,
) -> String {
    let mut out = String::from("### Progress Status\n\n");
    let undeploying = (step == ProgressStep::Undeploying).then_some(ProgressStep::Undeploying);
    for s in ProgressStep::DEPLOY_STEPS.into_iter().chain(undeploying) {
        out.push_str(&format!("{} {}  \n", marker(s, step, outcome), s.label()));
    }

    out.push_str("\n## Deployment Url\n\n");
    if record.deployment_port == 0 {
        out.push_str("_Not deployed_\n");
    } else {
        out.push_str(&format!(
            "http://{}:{}\n",
            public_host, record.deployment_port
        ));
    }

    out.push_str("\n## Status\n\n");
    out.push_str(StatusBadge::for_state(step, outcome).markdown());
    out.push('\n');
    out
}

/// Publishes rendered progress as one comment per pull request.
#[derive(Clone)]
pub struct ProgressPublisher {
    comments: Arc<dyn CommentPublisher>,
    store: RecordStore,
    public_host: String,
}

impl ProgressPublisher {
    pub fn new(
        comments: Arc<dyn CommentPublisher>,
        store: RecordStore,
        public_host: impl Into<String>,
    ) -> Self {
        Self {
            comments,
            store,
            public_host: public_host.into(),
        }
    }

    /// Create the status comment on first use, edit it afterwards.
    ///
    /// A newly created comment id is written into `record` and persisted.
    /// If persisting it fails the error is returned, and `record` still
    /// carries the id so later updates in this run edit the same comment.
    pub async fn publish(
        &self,
        record: &mut PullRequestRecord,
        step: ProgressStep,
        outcome: Outcome,
    ) -> Result<(), DeployError> {
        let body = render(record, step, outcome, &self.public_host);
        let target = CommentTarget::for_record(record);

        if record.comment_id == 0 {
            let id = self
                .comments
                .create(&target, &body)
                .await
                .map_err(DeployError::Publish)?;
            record.comment_id = id;
            info!(pr_id = record.pr_id, comment_id = id, "status comment created");
            self.store.update(record, |r| r.comment_id = id).await?;
        } else {
            self.comments
                .edit(&target, record.comment_id, &body)
                .await
                .map_err(DeployError::Publish)?;
            debug!(pr_id = record.pr_id, comment_id = record.comment_id, %step, %outcome, "status comment updated");
        }
        Ok(())
    }
}
