//! Observable holder of the current process state

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::state::{reduce_with_limit, ProcessAction, ProcessState, DEFAULT_MAX_LINES};

/// Owns the current [`ProcessState`] and publishes every change
pub struct ProcessTracker {
    tx: watch::Sender<Arc<ProcessState>>,
    max_lines: usize,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::with_state(ProcessState::Idle)
    }

    pub fn with_state(state: ProcessState) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(state));
        Self {
            tx,
            max_lines: DEFAULT_MAX_LINES,
        }
    }

    /// Keep at most `max_lines` output lines per tracked process
    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines;
        self
    }

    pub fn state(&self) -> Arc<ProcessState> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ProcessState>> {
        self.tx.subscribe()
    }

    /// Apply `action`. Returns whether the state changed.
    pub fn dispatch(&self, action: ProcessAction) -> bool {
        self.tx.send_if_modified(|current| {
            let next = reduce_with_limit(current, action, self.max_lines);
            if Arc::ptr_eq(&next, current) {
                return false;
            }
            debug!("Process state changed to {:?}", state_name(&next));
            *current = next;
            true
        })
    }
}

impl Default for ProcessTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn state_name(state: &ProcessState) -> &'static str {
    match state {
        ProcessState::Idle => "idle",
        ProcessState::Starting { .. } => "starting",
        ProcessState::Running { .. } => "running",
        ProcessState::Completed { .. } => "completed",
    }
}
