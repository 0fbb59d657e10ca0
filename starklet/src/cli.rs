use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "starklet", version, about = "stark node agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the node agent with a config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
}
