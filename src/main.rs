//! Image transcoding service
//!
//! Serves the transcoding engine over HTTP for the web front-end.

use img_transcode::config::Config;
use img_transcode::router::create_router;
use img_transcode::state::AppState;

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "img_transcode=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting image transcoding service...");

    let config = Arc::new(Config::from_env());
    info!("Configuration loaded: {:?}", config);

    // Worker starts lazily on the first job
    let app_state = Arc::new(AppState::new(config.clone()));
    info!(
        workers = config.worker_count,
        queue = config.queue_size,
        telemetry = config.enhanced_telemetry,
        "Coordinator ready"
    );

    let app = create_router(app_state);

    let port = config.server_port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind to port");

    info!(port = port, "Server listening");

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .expect("Server error");
}
