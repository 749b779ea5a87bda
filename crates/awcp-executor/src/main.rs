// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use awcp_config::ExecutorConfig;
use awcp_executor::service::ExecutorService;
use awcp_executor::task::AckTaskExecutor;
use awcp_executor::{AppState, build_app, sweep};
use awcp_transport::ExecutorTransportRegistry;
use awcp_transport::archive::ArchiveExecutorTransport;
use awcp_transport::chunk::ChunkStore;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "awcp-executord", version, about = "AWCP executor daemon")]
struct Args {
    /// Bind address (overrides the config file).
    #[arg(long)]
    bind: Option<String>,

    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Work directory for assignments (overrides the config file).
    #[arg(long)]
    work_dir: Option<PathBuf>,

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
        Some(path) => ExecutorConfig::load_from_path(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => ExecutorConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(work_dir) = args.work_dir {
        config.work_dir = work_dir;
    }
    for warning in config.validate().context("validate config")? {
        warn!("config: {warning}");
    }

    let chunks = Arc::new(ChunkStore::new());
    let mut transports = ExecutorTransportRegistry::new();
    transports.register(Arc::new(ArchiveExecutorTransport::new(
        Arc::clone(&chunks),
        Duration::from_secs(config.chunk_timeout_secs),
    )));

    let service = ExecutorService::new(
        config.clone(),
        transports,
        chunks,
        Arc::new(AckTaskExecutor),
    )?;
    let recovered = service.recover().await.context("recover persisted state")?;
    if recovered > 0 {
        info!(recovered, "recovered persisted assignments");
    }
    sweep::spawn(Arc::clone(&service));

    let app = build_app(AppState { service });
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!(bind = %config.bind, work_dir = %config.work_dir.display(), "awcp-executord listening");

    axum::serve(listener, app).await.context("serve")
}
