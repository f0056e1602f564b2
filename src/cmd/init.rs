//! Database initialization command (`prdeploy init`).

use anyhow::{Context, Result};

use prdeploy::config::Config;
use prdeploy::deploy::db::DeployDb;

pub fn cmd_init(config: &Config) -> Result<()> {
    let path = &config.database.path;
    DeployDb::new(path).context("Failed to initialize database")?;
    println!("Database initialized at {}", path.display());
    Ok(())
}
