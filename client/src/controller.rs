//! Drives the tracker from api calls and stream events

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::api::ProcessApi;
use crate::error::{ClientError, Result};
use crate::state::{ProcessAction, ProcessState};
use crate::tracker::ProcessTracker;
use crate::types::{OutputLine, ProcessHandle, TopicEvent, PROCESS_TOPIC_PREFIX};

pub struct ProcessController {
    api: Arc<dyn ProcessApi>,
    tracker: Arc<ProcessTracker>,
}

impl ProcessController {
    pub fn new(api: Arc<dyn ProcessApi>, tracker: Arc<ProcessTracker>) -> Self {
        Self { api, tracker }
    }

    pub fn tracker(&self) -> &Arc<ProcessTracker> {
        &self.tracker
    }

    /// Start `command` and track it
    pub async fn start(&self, command: &str, cwd: Option<String>) -> Result<ProcessHandle> {
        if !self.tracker.dispatch(ProcessAction::Start {
            command: command.to_string(),
        }) {
            return Err(ClientError::InvalidState("a process is already being tracked"));
        }

        match self.api.start(command, cwd).await {
            Ok(handle) => {
                self.tracker.dispatch(ProcessAction::Started {
                    id: handle.id.clone(),
                    pid: handle.pid,
                });
                Ok(handle)
            }
            Err(e) => {
                self.tracker.dispatch(ProcessAction::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Adopt the first process the server reports as running
    pub async fn attach_running(&self) -> Result<Option<ProcessHandle>> {
        let Some(handle) = self.api.list().await?.into_iter().next() else {
            return Ok(None);
        };
        if !self.tracker.dispatch(ProcessAction::Attach {
            id: handle.id.clone(),
            pid: handle.pid,
        }) {
            return Err(ClientError::InvalidState("tracker is not idle"));
        }
        Ok(Some(handle))
    }

    /// Kill the tracked process. Its exit arrives through the stream.
    pub async fn kill(&self) -> Result<()> {
        let id = match self.tracker.state().as_ref() {
            ProcessState::Running { id, .. } => id.clone(),
            _ => return Err(ClientError::InvalidState("no running process")),
        };
        self.api.kill(&id).await
    }

    pub fn reset(&self) -> bool {
        self.tracker.dispatch(ProcessAction::Reset)
    }

    /// Fold one aggregated-stream event into the tracker.
    ///
    /// Events for other topics are ignored.
    pub fn apply(&self, event: &TopicEvent) -> bool {
        let Some(id) = event.topic.strip_prefix(PROCESS_TOPIC_PREFIX) else {
            return false;
        };
        let action = match event.event_type.as_str() {
            "output" => match serde_json::from_value::<OutputLine>(event.data.clone()) {
                Ok(line) => ProcessAction::Output {
                    id: id.to_string(),
                    line,
                },
                Err(e) => {
                    warn!("Malformed output event for process {}: {}", id, e);
                    return false;
                }
            },
            "exit" => ProcessAction::Exit {
                id: id.to_string(),
                code: event.data["code"].as_i64().map(|code| code as i32),
            },
            other => {
                debug!("Ignoring {} event for process {}", other, id);
                return false;
            }
        };
        self.tracker.dispatch(action)
    }

    /// Apply `events` until the tracked process completes, returning its code.
    ///
    /// Completion may also come from reconciliation rather than the stream.
    pub async fn follow<S>(&self, mut events: S) -> Result<Option<i32>>
    where
        S: Stream<Item = TopicEvent> + Unpin,
    {
        let mut state = self.tracker.subscribe();
        loop {
            let completed = match state.borrow_and_update().as_ref() {
                ProcessState::Completed { code, .. } => Some(*code),
                _ => None,
            };
            if let Some(code) = completed {
                return Ok(code);
            }

            tokio::select! {
                event = events.next() => match event {
                    Some(event) => {
                        self.apply(&event);
                    }
                    None => return Err(ClientError::Stream("event stream ended".to_string())),
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(ClientError::Stream("tracker dropped".to_string()));
                    }
                }
            }
        }
    }
}
