//! Event-to-action routing.
//!
//! Routing is a pure function of the event kind, its label and the record's
//! current label/deploy state. Deploy-vs-redeploy is decided later by the
//! pipeline from `deployed`.

use std::fmt;

/// Every event shape the orchestrator understands, plus a catch-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    PullRequestOpened,
    PullRequestReopened,
    PullRequestClosed,
    PullRequestLabeled,
    PullRequestUnlabeled,
    WorkflowRunCompleted,
    Unhandled { event: String, action: String },
}

impl EventKind {
    /// Classify a GitHub event name and `action` field.
    pub fn parse(event: &str, action: &str) -> Self {
        match (event, action) {
            ("pull_request", "opened") => Self::PullRequestOpened,
            ("pull_request", "reopened") => Self::PullRequestReopened,
            ("pull_request", "closed") => Self::PullRequestClosed,
            ("pull_request", "labeled") => Self::PullRequestLabeled,
            ("pull_request", "unlabeled") => Self::PullRequestUnlabeled,
            ("workflow_run", "completed") => Self::WorkflowRunCompleted,
            _ => Self::Unhandled {
                event: event.to_string(),
                action: action.to_string(),
            },
        }
    }

    pub fn is_handled(&self) -> bool {
        !matches!(self, Self::Unhandled { .. })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PullRequestOpened => f.write_str("pull_request.opened"),
            Self::PullRequestReopened => f.write_str("pull_request.reopened"),
            Self::PullRequestClosed => f.write_str("pull_request.closed"),
            Self::PullRequestLabeled => f.write_str("pull_request.labeled"),
            Self::PullRequestUnlabeled => f.write_str("pull_request.unlabeled"),
            Self::WorkflowRunCompleted => f.write_str("workflow_run.completed"),
            Self::Unhandled { event, action } => write!(f, "{}.{}", event, action),
        }
    }
}

/// What the orchestrator does in response to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Noop,
    EnsureRecord,
    Deploy,
    Undeploy,
    SetLabel(bool),
}

/// Inputs to [`route`] besides the event kind.
#[derive(Debug, Clone, Copy)]
pub struct RouteContext<'a> {
    pub label: Option<&'a str>,
    pub deployment_label: &'a str,
    pub labeled_to_deploy: bool,
    /// Recorded but not consulted: a failed workflow still
    /// deploys when the PR is labeled.
    pub workflow_succeeded: bool,
}

pub fn route(kind: &EventKind, ctx: &RouteContext<'_>) -> Action {
    let is_deployment_label = ctx.label == Some(ctx.deployment_label);
    match kind {
        EventKind::PullRequestOpened | EventKind::PullRequestReopened => Action::EnsureRecord,
        EventKind::PullRequestClosed => Action::Undeploy,
        EventKind::WorkflowRunCompleted if ctx.labeled_to_deploy => Action::Deploy,
        EventKind::WorkflowRunCompleted => Action::Noop,
        EventKind::PullRequestLabeled if is_deployment_label => Action::SetLabel(true),
        EventKind::PullRequestUnlabeled if is_deployment_label => Action::SetLabel(false),
        EventKind::PullRequestLabeled | EventKind::PullRequestUnlabeled => Action::Noop,
        EventKind::Unhandled { .. } => Action::Noop,
    }
}
