//! CLI module for the central relay, entry node and exit node.

use std::io;
use std::path::{Path, PathBuf};

use clap::Parser;
use ladder_core::{PROJECT_NAME, VERSION};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{self, CentralNodeConfig, EntryNodeConfig, ExitNodeConfig};
use crate::error::RelayError;
use crate::reactor;
use crate::session::Node;

/// CLI arguments for the central relay.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ladder-central",
    version,
    about = "Central relay: joins entry and exit nodes that cannot reach each other"
)]
pub struct CentralArgs {
    /// Config file path (toml).
    #[arg(short, long, default_value = "central.toml")]
    pub config: PathBuf,

    /// Log level override (e.g. "info", "debug", "trace").
    #[arg(long)]
    pub log_level: Option<String>,
}

/// CLI arguments for an entry node.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ladder-entry",
    version,
    about = "Entry node: exposes an exit node's service on a public port"
)]
pub struct EntryArgs {
    /// Config file path (toml).
    #[arg(short, long, default_value = "entry.toml")]
    pub config: PathBuf,

    /// Log level override (e.g. "info", "debug", "trace").
    #[arg(long)]
    pub log_level: Option<String>,
}

/// CLI arguments for an exit node.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ladder-exit",
    version,
    about = "Exit node: publishes a local service through the central relay"
)]
pub struct ExitArgs {
    /// Config file path (toml).
    #[arg(short, long, default_value = "exit.toml")]
    pub config: PathBuf,

    /// Log level override (e.g. "info", "debug", "trace").
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Run the central relay with the given CLI arguments.
pub async fn run_central(args: CentralArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(args.log_level.as_deref());
    let cfg: CentralNodeConfig = load_config(&args.config, config::validate_central)?;
    serve(Node::central(cfg)).await
}

/// Run an entry node with the given CLI arguments.
pub async fn run_entry(args: EntryArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(args.log_level.as_deref());
    let cfg: EntryNodeConfig = load_config(&args.config, config::validate_entry)?;
    serve(Node::entry(cfg)).await
}

/// Run an exit node with the given CLI arguments.
pub async fn run_exit(args: ExitArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(args.log_level.as_deref());
    let cfg: ExitNodeConfig = load_config(&args.config, config::validate_exit)?;
    serve(Node::exit(cfg)?).await
}

/// Loads and validates a config file, logging why it was refused.
fn load_config<T: DeserializeOwned>(
    path: &Path,
    validate: fn(&T) -> Result<(), RelayError>,
) -> Result<T, RelayError> {
    let cfg = config::load(path).and_then(|cfg| validate(&cfg).map(|()| cfg));
    if let Err(e) = &cfg {
        error!(config = %path.display(), error = %e, error_type = e.error_type(), "config refused");
    }
    cfg
}

async fn serve(node: Node) -> Result<(), Box<dyn std::error::Error>> {
    info!(version = VERSION, role = %node.role(), "{PROJECT_NAME} starting");
    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();

    tokio::spawn(async move {
        shutdown_signal_handler().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    reactor::run(node, shutdown)
        .await
        .map_err(|e: RelayError| Box::new(e) as Box<dyn std::error::Error>)
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_tracing(level: Option<&str>) {
    let level = level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .try_init();
}
