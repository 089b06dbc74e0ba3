//! Reconnecting consumer of the aggregated event stream

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::types::TopicEvent;

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const EVENT_QUEUE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

enum Flow {
    Reconnect,
    Stop,
}

/// Subscribes to `/api/events` and keeps the subscription alive.
///
/// After an error or a clean end of stream it waits `reconnect_delay` and
/// reconnects with the same topics. Replayed process history is left for the
/// reducer to deduplicate.
pub struct EventStream {
    client: reqwest::Client,
    base_url: String,
    project: Option<String>,
    topics: Vec<String>,
    reconnect_delay: Duration,
    state_tx: watch::Sender<ConnectionState>,
}

impl EventStream {
    pub fn new(base_url: impl Into<String>, topics: Vec<String>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project: None,
            topics,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            state_tx,
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn url(&self) -> Result<reqwest::Url> {
        let mut params = vec![("topics", self.topics.join(","))];
        if let Some(project) = &self.project {
            params.push(("project", project.clone()));
        }
        reqwest::Url::parse_with_params(&format!("{}/api/events", self.base_url), &params)
            .map_err(|e| ClientError::Stream(format!("invalid server url: {}", e)))
    }

    /// Run on a background task, delivering events to the returned receiver
    pub fn spawn(self) -> (mpsc::Receiver<TopicEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let handle = tokio::spawn(async move {
            if let Err(e) = self.run(tx).await {
                warn!("Event stream stopped: {}", e);
            }
        });
        (rx, handle)
    }

    /// Forward events to `tx` until it is dropped
    pub async fn run(self, tx: mpsc::Sender<TopicEvent>) -> Result<()> {
        let url = self.url()?;

        loop {
            self.state_tx.send_replace(ConnectionState::Connecting);
            match self.connect_once(&url, &tx).await {
                Ok(Flow::Stop) => break,
                Ok(Flow::Reconnect) => info!("Event stream ended, reconnecting"),
                Err(e) => warn!("Event stream error: {}", e),
            }
            self.state_tx.send_replace(ConnectionState::Disconnected);

            tokio::select! {
                _ = sleep(self.reconnect_delay) => {}
                _ = tx.closed() => break,
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        Ok(())
    }

    async fn connect_once(&self, url: &reqwest::Url, tx: &mpsc::Sender<TopicEvent>) -> Result<Flow> {
        let response = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                code: status.as_u16(),
                message: "event stream refused".to_string(),
            });
        }

        self.state_tx.send_replace(ConnectionState::Connected);
        debug!("Event stream connected to {}", url);

        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| ClientError::Stream(e.to_string()))?;
            if event.data.is_empty() {
                continue;
            }
            let parsed: TopicEvent = match serde_json::from_str(&event.data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Skipping undecodable event: {}", e);
                    continue;
                }
            };
            if tx.send(parsed).await.is_err() {
                return Ok(Flow::Stop);
            }
        }

        Ok(Flow::Reconnect)
    }
}
