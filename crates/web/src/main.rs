//! vmrelay console broker daemon

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vmrelay_common::Database;
use vmrelay_web::config::LogFormat;
use vmrelay_web::probe::spawn_retention_sweeper;
use vmrelay_web::{AppState, BrokerConfig, BrokerServer};

#[derive(Parser)]
#[command(name = "vmrelayd")]
#[command(about = "vmrelay - VM console connection broker and relay")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VMRELAY_CONFIG", default_value = "vmrelay.toml")]
    config: PathBuf,

    /// HTTP listen address (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path (overrides the config file)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = BrokerConfig::load(&cli.config)?;
    config.apply_env();
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    init_logging(cli.debug, config.log_format);
    info!("vmrelay broker v{}", vmrelay_common::VERSION);

    if config.auth.jwt_secret.is_empty() {
        config.auth.jwt_secret = hex::encode(rand::random::<[u8; 32]>());
        warn!("no JWT secret configured, generated a random one; tokens from other services will be rejected");
    }

    let addr: SocketAddr = config.listen.parse()?;
    let db = Database::open(&config.db_path)?;
    info!("Using database {}", config.db_path.display());

    let metrics = config.metrics.clone();
    let state = AppState::new(config, db)?;

    if metrics.probe_interval_secs > 0 {
        state.prober().spawn(Duration::from_secs(metrics.probe_interval_secs));
    }
    if metrics.purge_interval_secs > 0 {
        spawn_retention_sweeper(state.health.clone(), Duration::from_secs(metrics.purge_interval_secs));
    }

    let server = BrokerServer::new(state);
    tokio::select! {
        result = server.serve(addr) => result?,
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
    }

    info!("Broker shutdown complete");
    Ok(())
}

fn init_logging(debug: bool, format: LogFormat) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}
