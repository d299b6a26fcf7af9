//! Chunk replicator binary.

use chunk_replicator::cluster::MasterRole;
use chunk_replicator::config::ServiceConfig;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    Primary,
    Secondary,
}

#[derive(Parser)]
#[command(name = "chunk-replicator")]
#[command(about = "Keeps every chunk of a storage fleet at its configured redundancy")]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cell tag of this master
    #[arg(long, env = "REPLICATOR_CELL_TAG")]
    cell_tag: Option<u16>,

    /// Master role
    #[arg(long, value_enum)]
    role: Option<Role>,

    /// Prometheus metrics bind address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load or create configuration
    let mut config = if let Some(config_path) = args.config {
        ServiceConfig::from_file(&config_path)?
    } else {
        ServiceConfig::development()
    };

    // Override with CLI args
    if let Some(cell_tag) = args.cell_tag {
        config.cell_tag = cell_tag;
    }
    if let Some(role) = args.role {
        config.role = match role {
            Role::Primary => MasterRole::Primary,
            Role::Secondary => MasterRole::Secondary,
        };
    }
    if let Some(addr) = args.metrics_addr {
        config.observability.metrics_addr = addr;
        config.observability.metrics_enabled = true;
    }
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }
    if args.json_logs {
        config.observability.json_logs = true;
    }

    chunk_replicator::run(config).await?;

    Ok(())
}
