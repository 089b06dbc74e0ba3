//! Topic-based event bus for the aggregated stream

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::debug;

use crate::domain::events::{TopicEvent, PROGRESS_TOPIC, TICKETS_TOPIC};

/// Events a lagging subscriber may fall behind before it starts skipping
const TOPIC_CAPACITY: usize = 256;

/// Kind of project file change reported by the file watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Tickets,
    Progress,
}

impl ChangeKind {
    pub fn topic(&self) -> &'static str {
        match self {
            ChangeKind::Tickets => TICKETS_TOPIC,
            ChangeKind::Progress => PROGRESS_TOPIC,
        }
    }
}

/// Publish/subscribe fan-out keyed by topic name.
///
/// Delivery is best-effort and only reaches subscribers attached at publish
/// time. Nothing is retained for late subscribers.
pub struct EventBus {
    topics: Arc<DashMap<String, broadcast::Sender<TopicEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
        }
    }

    /// Bus key for a project-scoped topic
    pub fn project_key(topic: &str, project: &str) -> String {
        format!("{}@{}", topic, project)
    }

    /// Publish to `key`. Returns the number of subscribers reached.
    pub fn publish(&self, key: &str, event: TopicEvent) -> usize {
        let Some(sender) = self.topics.get(key).map(|s| s.value().clone()) else {
            return 0;
        };
        match sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                // Last subscriber went away; drop the idle channel
                self.topics
                    .remove_if(key, |_, sender| sender.receiver_count() == 0);
                0
            }
        }
    }

    /// Entry point for the project file watcher
    pub fn publish_project_change(
        &self,
        project: &str,
        kind: ChangeKind,
        data: serde_json::Value,
    ) -> usize {
        let key = Self::project_key(kind.topic(), project);
        let reached = self.publish(&key, TopicEvent::new(kind.topic(), "change", data));
        debug!("Published {} change for {} to {} subscriber(s)", kind.topic(), project, reached);
        reached
    }

    /// Subscribe to `key`, creating the topic on first use
    pub fn subscribe(&self, key: &str) -> TopicSubscription {
        let rx = self
            .topics
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();
        TopicSubscription {
            inner: BroadcastStream::new(rx),
            key: key.to_string(),
            topics: self.topics.clone(),
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.topics
            .get(key)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of one bus topic. Dropping the last subscription removes the topic.
///
/// A subscriber that lags yields `Err` with the number of skipped events.
pub struct TopicSubscription {
    inner: BroadcastStream<TopicEvent>,
    key: String,
    topics: Arc<DashMap<String, broadcast::Sender<TopicEvent>>>,
}

impl Stream for TopicSubscription {
    type Item = Result<TopicEvent, BroadcastStreamRecvError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        // Our receiver is still counted until `inner` drops
        if self
            .topics
            .remove_if(&self.key, |_, sender| sender.receiver_count() <= 1)
            .is_some()
        {
            debug!("Dropped idle topic {}", self.key);
        }
    }
}
