mod config;
mod download;
mod error;
mod format;
mod resolver;
mod video_id;

use std::sync::Arc;

use tokio::{net::TcpListener, signal};
use tracing::{info, warn};

use crate::{config::AppConfig, error::ApiError, resolver::YtDlpResolver};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "darkzone_yt=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();

    let resolver = YtDlpResolver::new(&config)
        .map_err(|error| ApiError::internal(format!("Could not build HTTP client: {error}")))?;

    match resolver.probe_version().await {
        Some(version) => info!("Using {} {version}", config.yt_dlp_path),
        None => warn!(
            "{} could not be executed. Downloads will fail until yt-dlp is installed.",
            config.yt_dlp_path
        ),
    }
    match config.resolve_timeout {
        Some(limit) => info!("Metadata resolution timeout: {limit:?}"),
        None => warn!("YT_DLP_TIMEOUT_SECONDS=0: metadata resolution is unbounded."),
    }

    let app = download::router(Arc::new(resolver));

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not bind {}: {error}",
                config.bind_addr
            ))
        })?;

    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn shutdown_signal() {
    if let Err(error) = signal::ctrl_c().await {
        warn!("Could not install Ctrl+C handler: {error}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
