use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, StatusCode};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    set_header::SetResponseHeaderLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
    ServiceBuilderExt,
};

use crate::handlers::{convert_handler, estimate_handler, health, info_handler};
use crate::state::AppState;

/// Room for multipart framing and the small text fields around the file
const FORM_OVERHEAD: usize = 64 * 1024;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    // Security Headers
    // - X-Content-Type-Options: nosniff
    // - X-Frame-Options: DENY
    let security_headers = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ));

    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", get(info_handler))
        .route("/api/convert", post(convert_handler))
        .route("/api/estimate", post(estimate_handler))
        .layer(DefaultBodyLimit::max(
            state.config.max_file_size.saturating_add(FORM_OVERHEAD),
        ))
        .layer(
            ServiceBuilder::new()
                .set_x_request_id(MakeRequestUuid)
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    Duration::from_secs(state.config.request_timeout_secs),
                ))
                .layer(CompressionLayer::new())
                .layer(cors)
                .layer(security_headers)
                .propagate_x_request_id(),
        )
        .with_state(state)
}
