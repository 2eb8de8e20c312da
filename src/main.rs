//! Unified ladder-rs CLI.
//!
//! This binary runs any of the three node roles:
//! - `ladder-rs central` - Run the central relay
//! - `ladder-rs entry` - Run an entry node
//! - `ladder-rs exit` - Run an exit node

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ladder_relay::cli::{CentralArgs, EntryArgs, ExitArgs};

/// Ladder-rs unified CLI.
#[derive(Parser)]
#[command(
    name = "ladder-rs",
    version,
    about = "NAT-traversal tunnels through a central relay",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the central relay.
    #[command(name = "central", alias = "relay")]
    Central(CentralArgs),

    /// Run an entry node.
    #[command(name = "entry")]
    Entry(EntryArgs),

    /// Run an exit node.
    #[command(name = "exit")]
    Exit(ExitArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Central(args) => ladder_relay::cli::run_central(args).await,
        Commands::Entry(args) => ladder_relay::cli::run_entry(args).await,
        Commands::Exit(args) => ladder_relay::cli::run_exit(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
