//! Pactum node binary: runs either a participant or the coordinator.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use pactum::distributed::dist_config::{
    CoordinatorConfig, DEFAULT_COORDINATOR_PORT, DEFAULT_COORDINATOR_WAL,
    DEFAULT_PARTICIPANT_PORT, ParticipantConfig,
};
use pactum::distributed::http_server::{coordinator_router, participant_router, serve};

/// Pactum CLI
#[derive(Parser, Debug)]
#[command(name = "pactum")]
#[command(about = "Two-phase commit coordinator and participants over HTTP")]
#[command(version)]
struct Cli {
    /// Address to bind
    #[arg(long, global = true, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    host: IpAddr,

    /// Enable verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run a participant node
    Participant {
        #[arg(long)]
        id: String,

        #[arg(long, default_value_t = DEFAULT_PARTICIPANT_PORT)]
        port: u16,

        /// Write-ahead log file; empty or absent keeps the log in memory
        #[arg(long, default_value = "")]
        wal: String,
    },
    /// Run the coordinator
    Coordinator {
        #[arg(long, default_value = "coord")]
        id: String,

        #[arg(long, default_value_t = DEFAULT_COORDINATOR_PORT)]
        port: u16,

        /// Comma-separated participant base URLs
        #[arg(long, value_delimiter = ',', required = true)]
        participants: Vec<String>,

        /// Decision log file; empty keeps the log in memory
        #[arg(long, default_value = DEFAULT_COORDINATOR_WAL)]
        wal: String,

        /// Timeout of every call to a participant
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,

        /// Pause between writing the decision and broadcasting it
        #[arg(long, default_value_t = 0)]
        decision_delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    match cli.role {
        Role::Participant { id, port, wal } => {
            let config = ParticipantConfig {
                node_id: id,
                listen: SocketAddr::new(cli.host, port),
                wal_path: wal_path(wal),
            };
            run_participant(config).await
        }
        Role::Coordinator {
            id,
            port,
            participants,
            wal,
            timeout_ms,
            decision_delay_ms,
        } => {
            let config = CoordinatorConfig {
                node_id: id,
                listen: SocketAddr::new(cli.host, port),
                participants,
                wal_path: wal_path(wal),
                rpc_timeout: Duration::from_millis(timeout_ms),
                decision_delay: Duration::from_millis(decision_delay_ms),
            };
            run_coordinator(config).await
        }
    }
}

fn wal_path(arg: String) -> Option<PathBuf> {
    (!arg.is_empty()).then(|| PathBuf::from(arg))
}

async fn run_participant(config: ParticipantConfig) -> anyhow::Result<()> {
    // Replay completes before the listener accepts anything.
    let participant = config
        .open_participant()
        .with_context(|| format!("failed to recover participant {}", config.node_id))?;
    info!(
        "participant {} ready, wal: {}",
        config.node_id,
        config
            .wal_path
            .as_ref()
            .map_or_else(|| "<memory>".to_string(), |p| p.display().to_string())
    );

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    serve(listener, participant_router(Arc::new(participant))).await?;
    Ok(())
}

async fn run_coordinator(config: CoordinatorConfig) -> anyhow::Result<()> {
    let coordinator = config
        .open_coordinator()
        .context("failed to start coordinator")?;
    info!(
        "coordinator {} ready, participants: {}",
        config.node_id,
        config.participants.join(", ")
    );

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    serve(listener, coordinator_router(Arc::new(coordinator))).await?;
    Ok(())
}
