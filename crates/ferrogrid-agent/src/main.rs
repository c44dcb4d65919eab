//! Ferrogrid Agent Binary
//!
//! Connects to a grid and serves the tokens declared in its configuration.

use anyhow::{Context, Result};
use clap::Parser;
use ferrogrid_agent::{Agent, AgentConf};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "ferrogrid-agent", version, about = "Ferrogrid execution agent")]
struct Args {
    /// Path of the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Override the grid address
    #[arg(long)]
    grid_host: Option<String>,

    /// Override the working directory
    #[arg(long)]
    working_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut conf = AgentConf::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(grid_host) = args.grid_host {
        conf = conf.with_grid_host(grid_host);
    }
    if let Some(working_dir) = args.working_dir {
        conf = conf.with_working_dir(working_dir);
    }

    let mut agent = Agent::new(conf)?;
    info!(agent = %agent.agent_id(), "Starting Ferrogrid agent");

    if let Some(shutdown) = agent.shutdown_sender() {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown.send(());
            }
        });
    }

    if let Err(e) = agent.run().await {
        error!("Agent error: {:#}", e);
        std::process::exit(1);
    }

    info!("Agent shutting down");
    Ok(())
}
