//! Process HTTP handlers

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use tracing::info;

use crate::domain::types::{ProcessEvent, ProcessHandle, ProcessStatus};
use crate::{AppState, Error, Result};

/// Start process request
#[derive(Debug, Deserialize)]
pub struct StartProcessRequest {
    pub command: String,
    pub cwd: Option<String>,
}

/// Start a shell command
pub async fn start_process(
    State(state): State<AppState>,
    Json(req): Json<StartProcessRequest>,
) -> Result<Json<ProcessHandle>> {
    if req.command.trim().is_empty() {
        return Err(Error::InvalidParameter("command must not be empty".to_string()));
    }

    let handle = state.process_service.start(&req.command, req.cwd.as_deref())?;
    Ok(Json(handle))
}

/// List processes that are still running
pub async fn list_processes(State(state): State<AppState>) -> Json<Vec<ProcessHandle>> {
    Json(state.process_service.list_running())
}

/// Status of one process. Unknown ids report `not_found` rather than 404.
pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ProcessStatus> {
    Json(state.process_service.status(&id))
}

/// Kill a running process
pub async fn kill_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.process_service.kill(&id)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Stream a process's output (SSE), replaying buffered lines first
pub async fn stream_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let subscription = state.process_service.subscribe(&id)?;
    info!("Streaming output of process {}", id);

    let connected = named_event(
        "connected",
        serde_json::json!({ "id": id, "timestamp": Utc::now().timestamp_millis() }),
    );

    // The subscription ends right after the exit event
    let events = subscription.map(|event| match event {
        ProcessEvent::Output(line) => named_event("output", line),
        ProcessEvent::Lagged => named_event("lagged", serde_json::json!({})),
        ProcessEvent::Exit { code } => named_event("exit", serde_json::json!({ "code": code })),
    });

    let stream = stream::once(async move { connected })
        .chain(events)
        .map(Ok);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn named_event(name: &str, data: impl serde::Serialize) -> Event {
    Event::default()
        .event(name)
        .json_data(data)
        .unwrap_or_else(|e| Event::default().comment(format!("failed to encode {}: {}", name, e)))
}
