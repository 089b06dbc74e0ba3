//! Process domain types

use serde::{Deserialize, Serialize};

/// Identity of a spawned process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub id: String,
    pub pid: u32,
}

/// Which pipe a line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// One decoded line of process output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    /// Per-process arrival counter, starting at 1, shared by both streams
    pub seq: u64,
    pub stream: OutputStream,
    pub line: String,
    /// Unix epoch milliseconds
    pub timestamp: i64,
}

/// Event delivered to process output subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(OutputLine),
    /// The subscriber fell behind and live lines were dropped; the exit still follows
    Lagged,
    /// `code` is `None` when the process was terminated by a signal
    Exit { code: Option<i32> },
}

/// Server-side verdict about a process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessStatus {
    Running { pid: u32 },
    Exited { code: Option<i32> },
    NotFound,
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running { .. })
    }
}
