use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use prdeploy::config::{Config, DEFAULT_CONFIG_FILE};

mod cmd;

#[derive(Parser)]
#[command(name = "prdeploy")]
#[command(version, about = "Preview deployments for pull requests, driven by GitHub webhooks")]
pub struct Cli {
    /// Path to the configuration file. Defaults apply when it does not exist.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook server
    Serve {
        /// Port to listen on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Create the database and exit
    Init {
        /// Database file (overrides database.path)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Show every known pull request and its deployment state
    Status,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_directives = if verbose {
        "prdeploy=debug,tower_http=debug"
    } else {
        "prdeploy=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let mut config = Config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            cmd::cmd_serve(config).await?;
        }
        Commands::Init { db_path } => {
            if let Some(path) = db_path {
                config.database.path = path;
            }
            cmd::cmd_init(&config)?;
        }
        Commands::Status => cmd::cmd_status(&config).await?,
    }

    Ok(())
}
