//! Normalization of raw GitHub webhook deliveries into [`PullRequestEvent`]s.

use serde_json::Value;

use super::models::PullRequestEvent;
use super::router::EventKind;
use crate::errors::WebhookError;

fn str_at<'a>(payload: &'a Value, pointer: &str) -> Option<&'a str> {
    payload.pointer(pointer).and_then(Value::as_str)
}

fn i64_at(payload: &Value, pointer: &str) -> Option<i64> {
    payload.pointer(pointer).and_then(Value::as_i64)
}

/// Parse a delivery.
///
/// Returns `Ok(None)` for deliveries that are not about a pull request the
/// orchestrator handles: unknown event/action pairs, and workflow runs not
/// attached to any pull request.
pub fn parse_event(
    event_header: Option<&str>,
    payload: &Value,
) -> Result<Option<PullRequestEvent>, WebhookError> {
    let event_name = event_header
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .ok_or(WebhookError::MissingEventHeader)?;
    let action = str_at(payload, "/action").unwrap_or_default();

    let kind = EventKind::parse(event_name, action);
    if !kind.is_handled() {
        return Ok(None);
    }

    let pr_root = match kind {
        EventKind::WorkflowRunCompleted => {
            let has_pr = payload
                .pointer("/workflow_run/pull_requests/0")
                .is_some();
            if !has_pr {
                return Ok(None);
            }
            "/workflow_run/pull_requests/0"
        }
        _ => "/pull_request",
    };

    let label = kind.to_string();
    let missing = |field: &'static str| WebhookError::MissingField {
        event: label.clone(),
        field,
    };
    let pr_str = |suffix: &str| str_at(payload, &format!("{}{}", pr_root, suffix));
    let pr_i64 = |suffix: &str| i64_at(payload, &format!("{}{}", pr_root, suffix));

    let branch_name = pr_str("/head/ref").ok_or_else(|| missing("branch name"))?;
    let pr_id = pr_i64("/id").ok_or_else(|| missing("pull request id"))?;
    let pr_number = pr_i64("/number").ok_or_else(|| missing("pull request number"))?;
    let pr_url = pr_str("/url").unwrap_or_default();

    let repo_name = str_at(payload, "/repository/name").ok_or_else(|| missing("repository name"))?;
    let repo_address =
        str_at(payload, "/repository/html_url").ok_or_else(|| missing("repository url"))?;
    let ssh_address = str_at(payload, "/repository/ssh_url").unwrap_or_default();
    let owner_name =
        str_at(payload, "/repository/owner/login").ok_or_else(|| missing("owner name"))?;
    let owner_id = i64_at(payload, "/repository/owner/id").ok_or_else(|| missing("owner id"))?;
    let installation_id =
        i64_at(payload, "/installation/id").ok_or_else(|| missing("installation id"))?;

    Ok(Some(PullRequestEvent {
        branch_name: branch_name.to_string(),
        pr_id,
        pr_number,
        pr_url: pr_url.to_string(),
        repo_name: repo_name.to_string(),
        repo_address: repo_address.to_string(),
        ssh_address: ssh_address.to_string(),
        owner_name: owner_name.to_string(),
        owner_id,
        installation_id,
        label: str_at(payload, "/label/name").map(str::to_string),
        workflow_conclusion: str_at(payload, "/workflow_run/conclusion").map(str::to_string),
        kind,
    }))
}
