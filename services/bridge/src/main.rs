//! bridgeproxy
//!
//! Local TCP endpoint that tunnels clients through a chain of HTTP(S)
//! CONNECT proxies.
//!
//! This service:
//! - Loads the peer chain and listener settings from a TOML file
//! - Keeps one pre-dialed tunnel ready per chain
//! - Forwards clients directly, by TLS SNI, or as an HTTP proxy

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bridgeproxy::config::{Config, Overrides};
use bridgeproxy::proxy::{ChainDialer, ConnectionPool, Listener, ListenerConfig, ListenerMode};

#[derive(Debug, Parser)]
#[command(name = "bridgeproxy", version, about = "Chaining CONNECT proxy bridge")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "BRIDGE_CONFIG")]
    config: PathBuf,

    /// Local address to listen on.
    #[arg(long, env = "BRIDGE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Entry point: direct, tls or http.
    #[arg(long, env = "BRIDGE_MODE")]
    mode: Option<ListenerMode>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, env = "BRIDGE_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(
        &cli.config,
        Overrides {
            listen: cli.listen,
            mode: cli.mode,
            log_level: cli.log_level,
        },
    )?;

    // Initialize tracing (prefer RUST_LOG, fallback to configured level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting bridgeproxy");
    info!(
        listen = %config.listen,
        mode = %config.mode,
        hops = config.chain.len(),
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let pool = Arc::new(ConnectionPool::new(ChainDialer::with_timeouts(
        config.timeouts,
    )));

    let mut listener_config = ListenerConfig::new(config.listen, config.mode);
    listener_config.max_connections = config.max_connections;
    listener_config.sni_config = config.sni.clone();

    let listener = match Listener::bind(listener_config, config.chain.clone(), pool).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %config.listen, error = %e, "Failed to bind listener");
            return Err(e).with_context(|| format!("Failed to bind {}", config.listen));
        }
    };

    tokio::select! {
        result = listener.run() => {
            result.context("Listener stopped")?;
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutting down");
        }
    }

    Ok(())
}
