use std::sync::Arc;

use media_drop::{
    config::Config,
    error::ApiError,
    extractor::YtDlpExtractor,
    routes::{AppState, build_router},
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_drop=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create download directory {}: {error}",
                config.download_dir.display()
            ))
        })?;

    if config.yt_dlp_timeout.is_none() {
        warn!("YT_DLP_TIMEOUT_SECONDS is not set; a stalled extraction stalls its request.");
    }

    let extractor = Arc::new(YtDlpExtractor::new(
        &config.yt_dlp_command,
        config.yt_dlp_timeout,
    ));
    let addr = config.bind_addr.clone();
    let app = build_router(AppState::new(config, extractor))?;

    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {addr}: {error}"))
    })?;

    info!("Listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
