//! HTTP API handlers

mod events;
mod health;
mod process;
mod terminal;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub use terminal::REMOTE_REFUSED_CLOSE_CODE;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Process routes
        .route("/process", post(process::start_process))
        .route("/process", get(process::list_processes))
        .route("/process/{id}", get(process::get_status))
        .route("/process/{id}/kill", post(process::kill_process))
        .route("/process/{id}/stream", get(process::stream_process))
        // Aggregated event stream
        .route("/events", get(events::event_stream))
        // Interactive terminal
        .route("/terminal", get(terminal::terminal_websocket));

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
