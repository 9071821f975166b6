mod bus;
mod config;
mod daemon;
mod discovery;
mod filter;
mod mailbox;
mod registry;
mod router;
mod security;
#[cfg(test)]
mod testutil;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::bus::HttpBusClient;
use crate::config::{Config, ConfigFile, Overrides};
use crate::daemon::Daemon;
use crate::router::ClaudeWorker;

#[derive(Parser)]
#[command(
    name = "nyarla",
    version,
    about = "Bridges local Claude Code sessions to the agent event bus"
)]
struct Cli {
    /// Environment to run against (dev, test, live)
    #[arg(long)]
    env: Option<String>,

    /// Bus base URL (overrides config)
    #[arg(long)]
    api_url: Option<String>,

    /// Bus credential (overrides config)
    #[arg(long)]
    project_key: Option<String>,

    /// Identifier for this host
    #[arg(long)]
    machine_id: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long, value_name = "MS")]
    heartbeat_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("nyarla=info,reqwest=warn,hyper=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let overrides = Overrides {
        env: cli.env,
        api_url: cli.api_url,
        project_key: cli.project_key,
        machine_id: cli.machine_id,
        heartbeat_interval_ms: cli.heartbeat_interval,
    };

    let claude_dir = std::env::var("NYARLA_CLAUDE_DIR")
        .map(PathBuf::from)
        .ok()
        .or_else(|| dirs::home_dir().map(|h| h.join(".claude")))
        .context("cannot determine home directory")?;
    let file = ConfigFile::load_if_present(&claude_dir.join("comms").join("config.toml"))?;
    let config = Config::resolve(file, &overrides)?;

    tracing::info!(
        environment = %config.environment,
        api_url = %config.api_url,
        machine_id = %config.machine_id,
        security = config.security.is_some(),
        "starting daemon"
    );

    let http = Arc::new(
        HttpBusClient::new(&config.api_url, &config.project_key)
            .context("failed to build bus client")?,
    );
    let daemon = Daemon::new(
        config,
        http.clone(),
        Some(http),
        Arc::new(ClaudeWorker::new()),
    );

    daemon.start().await.context("daemon startup failed")?;
    daemon.wait_stopped().await;
    tracing::info!("daemon stopped");
    Ok(())
}
