mod agent;
mod auth;
mod cli;
mod config;
mod persist;
mod pod_handler;

use clap::Parser;
use cli::{Cli, Commands};
use log::info;

use crate::agent::NodeAgent;
use crate::config::load_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config.to_str().unwrap())?;
            agent::init_crypto();

            let agent = NodeAgent::new(cfg)?;
            agent.start().await?;
            info!("agent started, press ctrl-c to stop");

            tokio::signal::ctrl_c().await?;
            agent.stop().await;
        }
    }

    Ok(())
}
