//! Terminal transport messages

use serde::{Deserialize, Serialize};

/// Parameters supplied when a viewer connects
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Existing session to reattach to
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub label: Option<String>,
    /// Seed context handed to the shell environment
    pub context: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Summary of a live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub label: String,
    pub pid: Option<u32>,
    /// RFC 3339 creation time
    pub created_at: String,
}

/// Message sent by a terminal viewer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    ListSessions,
    CloseSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

/// Message sent to a terminal viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready {
        pid: Option<u32>,
        #[serde(rename = "sessionId")]
        session_id: String,
        reattached: bool,
    },
    Output {
        data: String,
    },
    Exit {
        code: Option<i32>,
    },
    Error {
        message: String,
    },
    Sessions {
        sessions: Vec<SessionSummary>,
    },
    SessionClosed {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    CloseSessionResult {
        #[serde(rename = "sessionId")]
        session_id: String,
        success: bool,
    },
}
