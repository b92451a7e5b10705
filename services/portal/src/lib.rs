pub mod config;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod session;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    middleware, Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::services::AppState;

/// Multipart overhead allowed on top of the photo size limit.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

/// The full portal application with its state applied.
pub fn build_app(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .server
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(AllowOrigin::list(origins));

    let body_limit = state.config.storage.max_photo_bytes + FORM_OVERHEAD_BYTES;

    routes::create_routes(state.clone())
        .fallback(session::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), session::session_cookies))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
