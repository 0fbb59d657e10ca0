use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "starkd", version, about = "stark orchestrator daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the orchestrator daemon with a config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
}
