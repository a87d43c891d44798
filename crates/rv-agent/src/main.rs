//! Rendezvous tunnel agent
//!
//! Opens one outbound control connection to a rendezvous proxy and bridges
//! every virtual connection it announces to a local TCP service. A small
//! health page is served on the default port.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rv_agent::credentials::FileCredentialProvider;
use rv_agent::directory::HttpDirectoryService;
use rv_agent::TunnelListener;
use rv_core::config::{default_config_path, FileConfigStore};

#[derive(Parser)]
#[command(name = "rv-agent")]
#[command(about = "Rendezvous tunnel agent - exposes a local service through a proxy")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control endpoint of the rendezvous proxy (host:port)
    #[arg(short, long, env = "RV_ENDPOINT")]
    endpoint: Option<String>,

    /// Hostname to register with the proxy
    #[arg(long)]
    hostname: Option<String>,

    /// Local target host
    #[arg(long)]
    target_host: Option<String>,

    /// Local target port
    #[arg(long)]
    target_port: Option<u16>,

    /// Health page port (persisted when it differs from the config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Require server credentials before going ready
    #[arg(long)]
    secure: bool,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Rendezvous agent starting...");

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let store = Arc::new(FileConfigStore::new(&config_path));
    let mut config = store.load_or_default();

    // Command-line overrides
    if let Some(endpoint) = args.endpoint {
        config.control_endpoint = endpoint;
    }
    if let Some(hostname) = args.hostname {
        config.proxy_hostname = hostname;
    }
    if let Some(host) = args.target_host {
        config.target_host = host;
    }
    if let Some(port) = args.target_port {
        config.target_port = port;
    }
    if args.secure {
        config.secure = true;
    }

    let credentials = Arc::new(FileCredentialProvider::new(config.credentials_dir.clone()));
    let mut listener = TunnelListener::new(config, store, Arc::new(HttpDirectoryService::new()))
        .with_credentials(credentials);

    if let Some(port) = args.port {
        listener.set_port(port)?;
    }

    listener
        .prepare()
        .await
        .context("Failed to prepare listener")?;

    let addr = listener.start().await.context("Failed to start listener")?;
    tracing::info!(
        "Agent running (health on {}, config {:?})",
        addr,
        config_path
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down...");

    listener.destroy().await;
    Ok(())
}
