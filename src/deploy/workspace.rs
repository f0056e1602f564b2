//! Deterministic build directories, one per pull request.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::models::PullRequestRecord;
use crate::errors::DeployError;
use crate::util::sanitize_path_component;

/// `builds_dir / <repo> / <branch>_<pr_number>`, with both components made
/// safe for use as a single directory name.
pub fn workspace_dir(builds_dir: &Path, record: &PullRequestRecord) -> PathBuf {
    builds_dir
        .join(sanitize_path_component(&record.repo_name))
        .join(format!(
            "{}_{}",
            sanitize_path_component(&record.branch_name),
            record.pr_number
        ))
}

/// Remove any previous checkout at `dir` and recreate it empty.
pub async fn prepare(dir: &Path) -> Result<(), DeployError> {
    remove(dir).await?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| DeployError::Workspace {
            path: dir.to_path_buf(),
            source,
        })?;
    debug!(path = %dir.display(), "workspace prepared");
    Ok(())
}

/// Recursively delete `dir`. A missing directory is not an error.
pub async fn remove(dir: &Path) -> Result<(), DeployError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            debug!(path = %dir.display(), "workspace removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DeployError::Workspace {
            path: dir.to_path_buf(),
            source,
        }),
    }
}
