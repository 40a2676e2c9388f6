use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use easel_core::{DeviceMap, EngineConfig, LoadOptions};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use state::AppState;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Easel image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model file or diffusers directory to load at startup, relative to the models directory
    #[arg(long)]
    model: Option<PathBuf>,

    /// JSON engine configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory scanned for models
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Directory generated images are saved to
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

impl Args {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(dir) = &self.models_dir {
            config.models_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if self.cpu {
            config.device = DeviceMap::ForceCpu;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "easel_server=debug,easel_core=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.engine_config()?;
    info!("Models directory: {}", config.models_dir.display());
    info!("Output directory: {}", config.output_dir.display());

    let grace = config.shutdown_grace();
    let state = AppState::new(config)?;

    if let Some(model) = &args.model {
        let path = state.resolve_model_path(model);
        let options = LoadOptions {
            device: state.config.device,
            ..Default::default()
        };
        state
            .orchestrator
            .load_model(&path, options)
            .with_context(|| format!("failed to start loading {}", path.display()))?;
    }

    let app = api::create_router(state.clone());

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on {}", listener.local_addr()?);

    let shutdown_state = state.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_state.begin_shutdown();
        })
        .await?;

    let orchestrator = state.orchestrator.clone();
    let stopped = tokio::task::spawn_blocking(move || orchestrator.shutdown(grace)).await?;
    if !stopped {
        warn!("Worker still busy after {grace:?}, exiting anyway");
    }
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
