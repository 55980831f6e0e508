mod audit;
mod cleanup;
mod config;
mod cookies;
mod delivery;
mod download;
mod error;
mod locator;
mod routes;
#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, process::ExitCode};

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::AppConfig,
    download::Platform,
    error::ApiError,
    routes::{AppState, router},
};

const DEFAULT_LOG_FILTER: &str = "media_downloader=info,tower_http=info";

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            tracing::error!("Media downloader stopped: {}", failure.message);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();
    config.ensure_dirs().await.map_err(|error| {
        ApiError::internal(format!("Could not create data directories: {error}"))
    })?;

    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: the socket address is used as the client IP.");
    }
    match config.max_concurrent_downloads {
        Some(limit) => info!("Concurrent downloads capped at {limit}"),
        None => info!("Concurrent downloads are not capped"),
    }

    let state = AppState::new(config);
    info!("Using yt-dlp at: {:?}", state.locator.locate());
    info!("Cookies directory: {:?}", state.cookies.dir());
    info!("Temp directory: {:?}", state.downloader.temp_dir());
    for platform in Platform::ALL {
        match state.cookies.active_path(platform).await {
            Some(path) => info!("{} cookies available at {:?}", platform.label(), path),
            None => info!("No {} cookies found, upload via /upload-cookies", platform.label()),
        }
    }

    let stale = state.cleanup.sweep().await;
    if stale > 0 {
        info!("Startup sweep removed {stale} stale temp file(s)");
    }
    state.cleanup.start_sweeper();

    let cleanup = state.cleanup.clone();
    let addr = state.config.bind_addr.clone();
    let app = router(state)?;

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("Media downloader listening on http://{addr}");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    cleanup.shutdown_sweep().await;

    served.map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!("Failed to install SIGTERM handler: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }

    info!("Cleaning up and shutting down...");
}
