//! Test harness for the OpsDeck integration tests
//!
//! Each test boots its own server on an ephemeral loopback port.

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use axum::extract::connect_info::MockConnectInfo;
use eventsource_stream::{Event, Eventsource};
use futures_util::{SinkExt, Stream, StreamExt};
use opsdeck_server::{AppState, Config};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Upper bound for any single wait in a test
pub const WAIT: Duration = Duration::from_secs(15);

pub type TerminalSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config tuned for tests
pub fn test_config() -> Config {
    Config {
        terminal_shell: "/bin/sh".to_string(),
        kill_grace_ms: 500,
        output_drain_ms: 200,
        ..Config::default()
    }
}

/// A server running in-process until dropped
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub client: reqwest::Client,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self::spawn(config, None).await
    }

    /// Serve as if every connection came from `peer`
    pub async fn with_peer(config: Config, peer: SocketAddr) -> Self {
        Self::spawn(config, Some(peer)).await
    }

    async fn spawn(config: Config, peer: Option<SocketAddr>) -> Self {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("Failed to read local addr");
        let state = AppState::new(Arc::new(config));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };

        match peer {
            None => {
                tokio::spawn(opsdeck_server::serve(listener, state.clone(), shutdown));
            }
            Some(peer) => {
                let app = opsdeck_server::router(state.clone()).layer(MockConnectInfo(peer));
                tokio::spawn(async move {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown)
                        .await
                });
            }
        }

        Self {
            addr,
            state,
            client: reqwest::Client::new(),
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url(), path)
    }

    pub fn terminal_url(&self, query: &str) -> String {
        format!("ws://{}/api/terminal?{}", self.addr, query)
    }

    /// Start a command through the HTTP api and return its id
    pub async fn start_process(&self, command: &str) -> String {
        let response = self
            .client
            .post(self.api_url("/process"))
            .json(&serde_json::json!({ "command": command }))
            .send()
            .await
            .expect("Failed to start process");
        assert!(response.status().is_success(), "start failed: {}", response.status());
        let handle: Value = response.json().await.expect("Failed to parse handle");
        handle["id"].as_str().expect("handle has no id").to_string()
    }

    /// Open an SSE endpoint and return its parsed events
    pub async fn sse(&self, path: &str) -> impl Stream<Item = Event> + Unpin {
        let response = self
            .client
            .get(self.api_url(path))
            .send()
            .await
            .expect("Failed to open event stream");
        assert!(response.status().is_success(), "stream refused: {}", response.status());
        Box::pin(
            response
                .bytes_stream()
                .eventsource()
                .filter_map(|event| async move { event.ok() }),
        )
    }

    pub async fn connect_terminal(&self, query: &str) -> TerminalSocket {
        let (socket, _) = connect_async(self.terminal_url(query))
            .await
            .expect("Failed to connect terminal socket");
        socket
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Read SSE events until `done` matches one, returning everything read
pub async fn collect_until<S>(events: &mut S, done: impl Fn(&Event) -> bool) -> Vec<Event>
where
    S: Stream<Item = Event> + Unpin,
{
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        while let Some(event) = events.next().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                break;
            }
        }
    })
    .await
    .expect("Timed out waiting for event");
    seen
}

pub async fn send_json(socket: &mut TerminalSocket, value: Value) {
    socket
        .send(Message::text(value.to_string()))
        .await
        .expect("Failed to send terminal message");
}

/// Next JSON text frame, or `None` once the socket closes
pub async fn next_json(socket: &mut TerminalSocket) -> Option<Value> {
    tokio::time::timeout(WAIT, async {
        while let Some(msg) = socket.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(text.as_str()).expect("invalid JSON frame"))
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    })
    .await
    .expect("Timed out waiting for terminal message")
}

/// Wait for the server's close frame and return its code and reason
pub async fn next_close(socket: &mut TerminalSocket) -> Option<(u16, String)> {
    tokio::time::timeout(WAIT, async {
        while let Some(msg) = socket.next().await {
            match msg {
                Ok(Message::Close(frame)) => {
                    return frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                }
                Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    })
    .await
    .expect("Timed out waiting for close frame")
}

/// Read frames until one has `"type": ty`
pub async fn next_of_type(socket: &mut TerminalSocket, ty: &str) -> Value {
    loop {
        let msg = next_json(socket)
            .await
            .unwrap_or_else(|| panic!("socket closed while waiting for {}", ty));
        if msg["type"] == ty {
            return msg;
        }
    }
}

/// Read output frames until their concatenation contains `needle`
pub async fn wait_for_output(socket: &mut TerminalSocket, needle: &str) {
    let mut seen = String::new();
    while !seen.contains(needle) {
        let msg = next_of_type(socket, "output").await;
        seen.push_str(msg["data"].as_str().unwrap_or_default());
    }
}
