//! Capstan proxy daemon.
//!
//! Loads the startup configuration (state file first, then the default
//! file), applies it to the registry, and serves the HTTP control plane.
//! Only a control-plane bind failure is fatal; config errors at boot are
//! logged and the daemon keeps running so it can be fixed over the API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use capstan_proxy::{create_router, AppState, Registry, StateFiles};

#[derive(Debug, Parser)]
#[command(name = "capstan-proxy", about = "L4 proxy and load balancer")]
struct Args {
    /// Default configuration file, read once at startup.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// State configuration file, read at startup and rewritten after every
    /// successful mutation.
    #[arg(long, value_name = "PATH")]
    state: Option<PathBuf>,

    /// Control plane listen address.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:9090")]
    http: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting capstan proxy");

    let registry = Arc::new(Registry::new());
    let files = Arc::new(StateFiles::new(args.config, args.state));

    if let Some(cfg) = files.load() {
        if let Err(e) = registry.update_config(&cfg).await {
            warn!(error = %e, "Unable to apply startup config");
        }
    }

    let app = create_router(AppState {
        registry: Arc::clone(&registry),
        files,
    });

    let listener = tokio::net::TcpListener::bind(&args.http)
        .await
        .with_context(|| format!("failed to bind control plane listener on {}", args.http))?;
    info!(addr = %args.http, "Control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down");
    registry.stop_all().await;

    Ok(())
}
