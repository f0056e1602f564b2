//! Configuration for prdeploy.
//!
//! Settings are read from a TOML file (default `prdeploy.toml`) and then
//! overridden from the environment. A missing file yields the defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [database]
//! path = ".prdeploy/prdeploy.db"
//!
//! [github]
//! app_id = 903361
//! private_key_path = "keys/app.pem"
//!
//! [deploy]
//! deployment_label = "deploy-preview"
//! builds_dir = "builds"
//! public_host = "203.0.113.7"
//! ssh_key_path = ".ssh/key"
//! install_command = "npm install"
//! build_command = "npm run build"
//! run_command = "npm start"
//! pm2_namespace = "previews"
//! command_timeout_secs = 1800
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "prdeploy.toml";

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// GitHub App credentials used to publish status comments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSection {
    #[serde(default)]
    pub app_id: Option<u64>,
    /// PEM file holding the App's private key.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    /// Inline PEM, normally supplied through `GITHUB_PRIVATE_KEY`.
    #[serde(skip)]
    pub private_key: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            app_id: None,
            private_key_path: None,
            private_key: None,
            api_url: default_api_url(),
        }
    }
}

impl GitHubSection {
    /// Resolve the private key PEM, preferring the inline value.
    pub fn private_key_pem(&self) -> Result<String> {
        if let Some(key) = &self.private_key {
            return Ok(key.clone());
        }
        let path = self
            .private_key_path
            .as_ref()
            .context("No GitHub private key configured (set GITHUB_PRIVATE_KEY or github.private_key_path)")?;
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read GitHub private key at {}", path.display()))
    }
}

/// Pipeline settings: where builds live and which commands run them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySection {
    #[serde(default = "default_deployment_label")]
    pub deployment_label: String,
    #[serde(default = "default_builds_dir")]
    pub builds_dir: PathBuf,
    /// Host name or address placed in the deployment URL of the status comment.
    #[serde(default = "default_public_host")]
    pub public_host: String,
    #[serde(default = "default_git_command")]
    pub git_command: String,
    /// Deploy key used for SSH clones. HTTPS is used when unset.
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
    #[serde(default = "default_install_command")]
    pub install_command: String,
    #[serde(default = "default_build_command")]
    pub build_command: String,
    #[serde(default = "default_run_command")]
    pub run_command: String,
    #[serde(default = "default_pm2_command")]
    pub pm2_command: String,
    #[serde(default = "default_pm2_namespace")]
    pub pm2_namespace: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            deployment_label: default_deployment_label(),
            builds_dir: default_builds_dir(),
            public_host: default_public_host(),
            git_command: default_git_command(),
            ssh_key_path: None,
            install_command: default_install_command(),
            build_command: default_build_command(),
            run_command: default_run_command(),
            pm2_command: default_pm2_command(),
            pm2_namespace: default_pm2_namespace(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl DeploySection {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// The complete prdeploy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub deploy: DeploySection,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".prdeploy/prdeploy.db")
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_deployment_label() -> String {
    "deploy-preview".to_string()
}

fn default_builds_dir() -> PathBuf {
    PathBuf::from("builds")
}

fn default_public_host() -> String {
    "127.0.0.1".to_string()
}

fn default_git_command() -> String {
    "git".to_string()
}

fn default_install_command() -> String {
    "npm install".to_string()
}

fn default_build_command() -> String {
    "npm run build".to_string()
}

fn default_run_command() -> String {
    "npm start".to_string()
}

fn default_pm2_command() -> String {
    "pm2".to_string()
}

fn default_pm2_namespace() -> String {
    "prdeploy".to_string()
}

fn default_command_timeout_secs() -> u64 {
    1800
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse prdeploy.toml")
    }

    /// Load from `path` if it exists, otherwise defaults; then apply the
    /// process environment.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = lookup("PRDEPLOY_PORT") {
            self.server.port = port.parse().context("PRDEPLOY_PORT must be a valid port")?;
        }
        if let Some(host) = lookup("PRDEPLOY_HOST") {
            self.server.host = host;
        }
        if let Some(path) = lookup("PRDEPLOY_DATABASE") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("PRDEPLOY_BUILDS_DIR") {
            self.deploy.builds_dir = PathBuf::from(dir);
        }
        if let Some(host) = lookup("PRDEPLOY_PUBLIC_HOST") {
            self.deploy.public_host = host;
        }
        if let Some(label) = lookup("DEPLOYMENT_LABEL") {
            self.deploy.deployment_label = label;
        }
        if let Some(app_id) = lookup("GITHUB_APP_ID") {
            self.github.app_id =
                Some(app_id.parse().context("GITHUB_APP_ID must be a valid number")?);
        }
        if let Some(key) = lookup("GITHUB_PRIVATE_KEY") {
            self.github.private_key = Some(key.replace("\\n", "\n"));
        }
        if let Some(path) = lookup("GITHUB_PRIVATE_KEY_PATH") {
            self.github.private_key_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Return human-readable problems with the configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.deploy.deployment_label.trim().is_empty() {
            problems.push("deploy.deployment_label must not be empty".to_string());
        }
        if self.deploy.command_timeout_secs == 0 {
            problems.push("deploy.command_timeout_secs must be greater than zero".to_string());
        }
        for (name, value) in [
            ("deploy.install_command", &self.deploy.install_command),
            ("deploy.build_command", &self.deploy.build_command),
            ("deploy.run_command", &self.deploy.run_command),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("{} must not be empty", name));
            }
        }
        if self.github.app_id.is_none() {
            problems.push("github.app_id is not set; status comments cannot be published".to_string());
        }
        problems
    }
}
