//! FluxMon Server - scraping, storage, rule evaluation and the HTTP API

mod api;
mod app;
mod protocol;

use anyhow::Context;
use app::App;
use clap::Parser;
use fluxmon_core::settings::Settings;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "fluxmon")]
#[command(about = "FluxMon monitoring server", version)]
struct Args {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Data directory, overrides `[storage] data_dir`
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// HTTP listen address, overrides `[server] listen`
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }

    let settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let listen = match args.listen {
        Some(addr) => addr,
        None => settings
            .server
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {:?}", settings.server.listen))?,
    };

    info!("Starting FluxMon server {}...", fluxmon_core::VERSION);
    if let Some(path) = &args.config {
        info!("Configuration: {}", path.display());
    }

    let app = App::start(settings, args.config.clone(), args.data_dir.as_deref()).await?;
    let router = api::create_router(app.clone());

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    info!("FluxMon server listening on {}", listen);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping background tasks...");
    app.shutdown().await;
    info!("Server shut down gracefully");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}
