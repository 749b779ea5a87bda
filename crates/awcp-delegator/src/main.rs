// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use awcp_config::DelegatorConfig;
use awcp_delegator::{AppState, build_app, sweep};
use awcp_delegator::service::DelegatorService;
use awcp_transport::DelegatorTransportRegistry;
use awcp_transport::archive::ArchiveDelegatorTransport;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "awcp-delegatord", version, about = "AWCP delegator daemon")]
struct Args {
    /// Bind address (overrides the config file).
    #[arg(long)]
    bind: Option<String>,

    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base directory for records, environments, and snapshots
    /// (overrides the config file).
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("awcp=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("awcp=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => DelegatorConfig::load_from_path(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => DelegatorConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(base_dir) = args.base_dir {
        config.base_dir = base_dir;
    }
    for warning in config.validate().context("validate config")? {
        warn!("config: {warning}");
    }

    let mut transports = DelegatorTransportRegistry::new();
    transports.register(Arc::new(ArchiveDelegatorTransport::default()));

    let service = DelegatorService::new(config.clone(), transports)?;
    let recovered = service.recover().await.context("recover persisted state")?;
    if recovered > 0 {
        info!(recovered, "recovered persisted delegations");
    }
    sweep::spawn(Arc::clone(&service));

    let app = build_app(AppState { service });
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!(bind = %config.bind, base_dir = %config.base_dir.display(), "awcp-delegatord listening");

    axum::serve(listener, app).await.context("serve")
}
