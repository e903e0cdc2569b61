//! Switchboard - unified CLI entrypoint.
//!
//! Usage:
//!   switchboard start --config config/switchboard.toml
//!   switchboard validate --config config/switchboard.toml
//!   switchboard connect --addr 127.0.0.1:7400 --token alice-token
//!   switchboard append --kind user --id 2 --op private --payload '{...}'

use anyhow::Result;
use clap::Parser;
use switchboard::cli::commands::{run_append, run_connect, run_start, run_validate};
use switchboard::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Validate(args) => run_validate(args),
        Commands::Connect(args) => run_connect(args).await,
        Commands::Append(args) => run_append(args).await,
    }
}
