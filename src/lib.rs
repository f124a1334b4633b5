pub mod api;
pub mod config;
pub mod pipeline;

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, ConfigError};
use crate::pipeline::ClinicalPipeline;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cannot start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Load configuration, build the pipeline and serve the API until Ctrl-C.
///
/// The pipeline holds blocking HTTP clients, so it is built before the async
/// runtime exists and dropped after the runtime is gone.
pub fn run() -> Result<(), StartupError> {
    let dotenv = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    match dotenv {
        Ok(path) => tracing::info!(path = %path.display(), "Loaded environment file"),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!(error = %e, "Ignoring unreadable environment file"),
    }

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let config = AppConfig::from_env()?;
    let pipeline = Arc::new(ClinicalPipeline::from_config(&config)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(StartupError::Runtime)?;
    let served = runtime.block_on(serve(pipeline.clone(), config.bind_addr));
    drop(runtime);
    drop(pipeline);
    served
}

async fn serve(pipeline: Arc<ClinicalPipeline>, addr: SocketAddr) -> Result<(), StartupError> {
    let mut server = api::start_api_server(pipeline, addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })?;

    tracing::info!(addr = %server.addr, "Listening, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for Ctrl-C: {e}");
    }

    server.shutdown();
    server.stopped().await;
    Ok(())
}
