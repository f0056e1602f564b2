//! Deployment overview command (`prdeploy status`).

use anyhow::{Context, Result};

use prdeploy::config::Config;
use prdeploy::deploy::db::SqliteRepository;
use prdeploy::deploy::models::PullRequestRecord;
use prdeploy::deploy::repository::Repository;

fn state_of(record: &PullRequestRecord) -> &'static str {
    if record.is_deploying {
        "deploying"
    } else if record.deployed {
        "deployed"
    } else if record.active {
        "open"
    } else {
        "closed"
    }
}

pub async fn cmd_status(config: &Config) -> Result<()> {
    let repo = SqliteRepository::open(&config.database.path)
        .context("Failed to open database")?;
    let records = repo.list().await?;

    if records.is_empty() {
        println!("No pull requests recorded yet.");
        return Ok(());
    }

    println!(
        "{:<12} {:<24} {:<32} {:<10} {:<6} {}",
        "PR ID", "REPOSITORY", "BRANCH", "STATE", "LABEL", "URL"
    );
    for record in &records {
        let url = if record.deployed {
            format!("http://{}:{}", config.deploy.public_host, record.deployment_port)
        } else {
            "-".to_string()
        };
        println!(
            "{:<12} {:<24} {:<32} {:<10} {:<6} {}",
            record.pr_id,
            format!("{}/{}#{}", record.owner_name, record.repo_name, record.pr_number),
            record.branch_name,
            state_of(record),
            if record.labeled_to_deploy { "yes" } else { "no" },
            url
        );
    }
    println!();
    println!(
        "{} pull request(s), {} deployed",
        records.len(),
        records.iter().filter(|r| r.deployed).count()
    );
    Ok(())
}
