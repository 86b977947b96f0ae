use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use talkhead_core::{ServiceConfig, VideoService, WeightFetcher};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;

use api::AppState;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "InfiniteTalk talking-head video generation server")]
struct Args {
    /// Host address to bind the server to
    #[arg(long, env = "TALKHEAD_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "TALKHEAD_PORT", default_value_t = 8000)]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Serve the HTTP endpoint (default)
    Serve,
    /// Download the model weights into WEIGHTS_DIR, skipping bundles already present
    FetchWeights {
        /// Hub token for gated repositories
        #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        host,
        port,
        command,
    } = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "talkhead_server=info,talkhead_core=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(ServiceConfig::from_env());
    config
        .ensure_dirs()
        .context("failed to create working directories")?;
    info!("workdir: {}", config.workdir.display());
    info!("weights dir: {}", config.weights_dir.display());
    info!("output dir: {}", config.out_dir.display());
    info!("code dir: {}", config.code_dir.display());

    match command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, &host, port).await,
        Command::FetchWeights { token } => fetch_weights(&config, token).await,
    }
}

async fn serve(config: Arc<ServiceConfig>, host: &str, port: u16) -> Result<()> {
    let state = Arc::new(AppState {
        service: VideoService::new(config),
    });

    // --- Build axum router with shared state ---
    let app = api::create_router(state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn fetch_weights(config: &ServiceConfig, token: Option<String>) -> Result<()> {
    let fetcher = WeightFetcher::new(config, token).context("failed to create hub client")?;
    let report = fetcher.fetch_all().await.context("weight download failed")?;
    for (bundle, status) in report {
        info!("{}: {:?}", bundle.repo_id(), status);
    }
    info!("all weights present under {}", config.weights_dir.display());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
