//! Aggregated event stream envelope and topic names

use serde::{Deserialize, Serialize};

pub const SYSTEM_TOPIC: &str = "system";
pub const TICKETS_TOPIC: &str = "tickets";
pub const PROGRESS_TOPIC: &str = "progress";
pub const PROCESS_TOPIC_PREFIX: &str = "process:";

/// Envelope for every message on the aggregated stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicEvent {
    pub topic: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

impl TopicEvent {
    pub fn new(topic: impl Into<String>, event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            event_type: event_type.into(),
            data,
        }
    }
}

/// A topic requested by a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Tickets,
    Progress,
    Process(String),
}

impl Topic {
    /// Parse a single entry of the `topics` query list
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match raw {
            TICKETS_TOPIC => Some(Topic::Tickets),
            PROGRESS_TOPIC => Some(Topic::Progress),
            _ => raw
                .strip_prefix(PROCESS_TOPIC_PREFIX)
                .filter(|id| !id.is_empty())
                .map(|id| Topic::Process(id.to_string())),
        }
    }

    /// Name used in the envelope `topic` field
    pub fn name(&self) -> String {
        match self {
            Topic::Tickets => TICKETS_TOPIC.to_string(),
            Topic::Progress => PROGRESS_TOPIC.to_string(),
            Topic::Process(id) => format!("{}{}", PROCESS_TOPIC_PREFIX, id),
        }
    }
}

/// Parse a comma-separated topic list, dropping unrecognized and duplicate entries
pub fn parse_topics(list: &str) -> (Vec<Topic>, Vec<String>) {
    let mut topics = Vec::new();
    let mut rejected = Vec::new();
    for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match Topic::parse(raw) {
            Some(topic) if !topics.contains(&topic) => topics.push(topic),
            Some(_) => {}
            None => rejected.push(raw.to_string()),
        }
    }
    (topics, rejected)
}
