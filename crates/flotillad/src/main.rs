//! flotillad — the Flotilla daemon.
//!
//! Single binary that assembles the control plane:
//! - Desired-state store (redb)
//! - Agent gateway (gRPC bidirectional streams, Ed25519 envelopes)
//! - Orchestration engine (event loop, dispatcher, stale-host sweeper)
//!
//! # Usage
//!
//! ```text
//! flotillad run --grpc-port 7443 --data-dir /var/lib/flotilla
//! ```
//!
//! Triggers (deploy, abort, migrate) arrive through the external HTTP
//! layer, which calls into the engine; this binary runs the engine and
//! the agent-facing stream endpoint.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod control_plane;

#[derive(Parser)]
#[command(name = "flotillad", about = "Flotilla daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Port the agent gateway listens on.
        #[arg(long, default_value = "7443")]
        grpc_port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/flotilla")]
        data_dir: PathBuf,

        /// Serve the agent gateway over TLS with generated certificates.
        #[arg(long)]
        tls: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flotillad=debug,flotilla=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            grpc_port,
            data_dir,
            tls,
        } => control_plane::run(grpc_port, data_dir, tls).await,
    }
}
