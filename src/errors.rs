//! Typed error hierarchy for prdeploy.
//!
//! Four enums cover the subsystems:
//! - `DeployError`: orchestration and pipeline stage failures
//! - `CommandError`: a single monitored subprocess failing to complete
//! - `RepositoryError`: persistence port failures
//! - `WebhookError`: raw webhook payload normalization failures

use std::path::PathBuf;

use thiserror::Error;

/// Errors from a monitored external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for `{program}`: {source}")]
    WaitFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited with code {code:?}")]
    NonZeroExit { program: String, code: Option<i32> },

    #[error("`{program}` timed out after {secs}s")]
    TimedOut { program: String, secs: u64 },

    #[error("`{program}` was cancelled")]
    Cancelled { program: String },
}

/// Errors from the persistence port.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Errors from the deployment lifecycle.
///
/// Stage errors are fatal to the current run but never roll back earlier
/// stages.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Required tool '{tool}' is not available on PATH")]
    ToolMissing { tool: String },

    #[error("Workspace error at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cloning branch '{branch}' failed: {source}")]
    Clone {
        branch: String,
        #[source]
        source: CommandError,
    },

    #[error("Installing dependencies failed: {0}")]
    Install(#[source] CommandError),

    #[error("Build failed: {0}")]
    Build(#[source] CommandError),

    #[error("Deploy failed: {0}")]
    Deploy(#[source] anyhow::Error),

    #[error("Pull request {pr_id} has no active deployment")]
    NotDeployed { pr_id: i64 },

    #[error(transparent)]
    Persistence(#[from] RepositoryError),

    #[error("Publishing progress failed: {0}")]
    Publish(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors normalizing a raw webhook delivery.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Missing X-GitHub-Event header")]
    MissingEventHeader,

    #[error("{event} - could not extract {field}")]
    MissingField { event: String, field: &'static str },
}
