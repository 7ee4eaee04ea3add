pub mod admin;
pub mod auth;
pub mod novels;
pub mod recommend;
pub mod social;

use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::envelope::Envelope;
use crate::error::AppError;
use crate::state::AppState;

/// The full API with its middleware stack.
pub fn router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs.max(1));
    Router::new()
        .route("/health", get(|| async { Envelope::ok("ok") }))
        .merge(auth::router())
        .merge(novels::router(state.config.upload.max_bytes))
        .merge(admin::router())
        .merge(recommend::router())
        .merge(social::router())
        .fallback(|| async { AppError::NotFound("Route".into()) })
        .layer(TimeoutLayer::new(timeout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
