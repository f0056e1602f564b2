//! Webhook server command (`prdeploy serve`).

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use prdeploy::config::Config;
use prdeploy::deploy::db::SqliteRepository;
use prdeploy::deploy::github::GitHubClient;
use prdeploy::deploy::orchestrator::PullRequestOrchestrator;
use prdeploy::deploy::server::{ServerConfig, start_server};
use prdeploy::deploy::supervisor::Pm2Supervisor;
use prdeploy::util::find_in_path;

pub async fn cmd_serve(config: Config) -> Result<()> {
    for problem in config.validate() {
        warn!("config: {}", problem);
    }

    let app_id = config
        .github
        .app_id
        .context("A GitHub App id is required (set GITHUB_APP_ID or github.app_id)")?;
    let private_key = config.github.private_key_pem()?;
    let comments = GitHubClient::new(app_id, &private_key, &config.github.api_url)?;

    let repo = SqliteRepository::open(&config.database.path)
        .context("Failed to initialize database")?;
    info!(path = %config.database.path.display(), "database ready");

    for tool in [&config.deploy.git_command, &config.deploy.pm2_command] {
        if find_in_path(tool).is_none() {
            warn!(tool = %tool, "not found on PATH; deployments will fail until it is installed");
        }
    }
    std::fs::create_dir_all(&config.deploy.builds_dir).with_context(|| {
        format!(
            "Failed to create builds directory {}",
            config.deploy.builds_dir.display()
        )
    })?;

    let supervisor = Pm2Supervisor::new(
        &config.deploy.pm2_command,
        &config.deploy.pm2_namespace,
        config.deploy.command_timeout(),
    );

    let shutdown = CancellationToken::new();
    let orchestrator = PullRequestOrchestrator::new(
        Arc::new(repo),
        Arc::new(comments),
        Arc::new(supervisor),
        config.deploy.clone(),
        shutdown.clone(),
    );

    start_server(
        ServerConfig {
            host: config.server.host.clone(),
            port: config.server.port,
        },
        Arc::new(orchestrator),
        shutdown,
    )
    .await
}
