//! OpsDeck process runtime
//!
//! Runs shell commands and interactive terminals for the ticket-ops
//! dashboard and streams their output to any number of viewers over SSE
//! and WebSocket.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};

use service::events::EventBus;
use service::process::{ProcessOptions, ProcessService};
use service::terminal::{TerminalOptions, TerminalService};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub process_service: Arc<ProcessService>,
    pub terminal_service: Arc<TerminalService>,
    pub event_bus: Arc<EventBus>,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            process_service: Arc::new(ProcessService::new(ProcessOptions::from_config(&config))),
            terminal_service: Arc::new(TerminalService::new(TerminalOptions::from_config(&config))),
            event_bus: Arc::new(EventBus::new()),
            config,
        }
    }

    /// Start the process sweeper and the orphan reaper
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.process_service
                .clone()
                .spawn_sweeper(self.config.process_sweep_interval()),
            self.terminal_service
                .clone()
                .spawn_reaper(self.config.orphan_sweep_interval()),
        ]
    }
}

/// Build the HTTP router
pub fn router(state: AppState) -> Router {
    api::http::create_router(state)
}

/// Serve the API on `listener` until `shutdown` resolves.
///
/// Peer addresses are attached to every request so the terminal endpoint
/// can tell loopback clients apart.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
