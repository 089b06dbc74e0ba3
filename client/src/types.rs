//! Wire types shared with the server

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub id: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of process output as streamed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub seq: u64,
    pub stream: OutputStream,
    pub line: String,
    pub timestamp: i64,
}

/// Server-side process status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessStatus {
    Running { pid: u32 },
    Exited { code: Option<i32> },
    NotFound,
}

/// Envelope of the aggregated event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicEvent {
    pub topic: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

pub const PROCESS_TOPIC_PREFIX: &str = "process:";

/// Aggregated stream topic for one process
pub fn process_topic(id: &str) -> String {
    format!("{}{}", PROCESS_TOPIC_PREFIX, id)
}
