//! Integration tests for the OpsDeck server
//!
//! Every test boots a server on 127.0.0.1 with an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use integration_tests::*;
use opsdeck_client::types::process_topic;
use opsdeck_client::{EventStream, HttpProcessApi, ProcessApi, ProcessController, ProcessTracker};
use opsdeck_server::service::events::ChangeKind;
use serde_json::{json, Value};

fn data(event: &eventsource_stream::Event) -> Value {
    serde_json::from_str(&event.data).expect("event data is not JSON")
}

// ============================================================================
// Health Tests
// ============================================================================

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::start().await;

    let response = server
        .client
        .get(server.api_url("/health"))
        .send()
        .await
        .expect("Failed to send health request");
    assert!(response.status().is_success());

    let health: Value = response.json().await.expect("Failed to parse health response");
    assert_eq!(health["status"], "healthy");
}

// ============================================================================
// Process Tests
// ============================================================================

#[tokio::test]
async fn test_process_stream_hello_world() {
    let server = TestServer::start().await;
    let id = server.start_process("echo hello && echo world").await;

    let mut events = server.sse(&format!("/process/{}/stream", id)).await;
    let events = collect_until(&mut events, |e| e.event == "exit").await;

    assert_eq!(events[0].event, "connected");
    assert_eq!(data(&events[0])["id"], id.as_str());

    let lines: Vec<Value> = events
        .iter()
        .filter(|e| e.event == "output")
        .map(data)
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["line"], "hello");
    assert_eq!(lines[0]["stream"], "stdout");
    assert_eq!(lines[1]["line"], "world");

    let exit = events.last().unwrap();
    assert_eq!(data(exit)["code"], 0);

    let status: Value = server
        .client
        .get(server.api_url(&format!("/process/{}", id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status, json!({ "status": "exited", "code": 0 }));

    let running: Vec<Value> = server
        .client
        .get(server.api_url("/process"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(running.iter().all(|h| h["id"] != id.as_str()));
}

#[tokio::test]
async fn test_process_exit_code_without_output() {
    let server = TestServer::start().await;
    let id = server.start_process("exit 42").await;

    let mut events = server.sse(&format!("/process/{}/stream", id)).await;
    let events = collect_until(&mut events, |e| e.event == "exit").await;

    assert!(events.iter().all(|e| e.event != "output"));
    assert_eq!(data(events.last().unwrap())["code"], 42);
}

#[tokio::test]
async fn test_kill_long_running_process() {
    let server = TestServer::start().await;
    let id = server.start_process("sleep 60").await;

    let mut events = server.sse(&format!("/process/{}/stream", id)).await;
    collect_until(&mut events, |e| e.event == "connected").await;

    let response = server
        .client
        .post(server.api_url(&format!("/process/{}/kill", id)))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let events = collect_until(&mut events, |e| e.event == "exit").await;
    assert_eq!(data(events.last().unwrap())["code"], Value::Null);

    let response = server
        .client
        .post(server.api_url(&format!("/process/{}/kill", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test]
async fn test_unknown_process_stream_is_404() {
    let server = TestServer::start().await;

    let response = server
        .client
        .get(server.api_url("/process/does-not-exist/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Process not found");
}

// ============================================================================
// Aggregated Stream Tests
// ============================================================================

#[tokio::test]
async fn test_event_stream_multiplexes_topics() {
    let server = TestServer::start().await;
    let id = server.start_process("echo from-process").await;
    let topic = process_topic(&id);

    let mut events = server
        .sse(&format!(
            "/events?project=%2Fsrv%2Frepo&topics=tickets,bogus,{}",
            topic
        ))
        .await;

    let first = collect_until(&mut events, |_| true).await;
    let connected = data(&first[0]);
    assert_eq!(connected["topic"], "system");
    assert_eq!(connected["type"], "connected");
    assert_eq!(connected["data"]["topics"], json!(["tickets", topic.clone()]));

    // Only subscribers of the same project receive a change
    server.state.event_bus.publish_project_change(
        "/srv/other",
        ChangeKind::Tickets,
        json!({ "file": "ignored.md" }),
    );
    server.state.event_bus.publish_project_change(
        "/srv/repo",
        ChangeKind::Tickets,
        json!({ "file": "T-1.md" }),
    );

    let mut ticket_files = Vec::new();
    let mut lines = Vec::new();
    let mut exited = false;
    tokio::time::timeout(WAIT, async {
        while ticket_files.is_empty() || !exited {
            let Some(event) = events.next().await else {
                break;
            };
            let message = data(&event);
            let is_process = message["topic"] == topic.as_str();
            match message["type"].as_str() {
                Some("change") if message["topic"] == "tickets" => {
                    ticket_files.push(message["data"]["file"].clone());
                }
                Some("output") if is_process => lines.push(message["data"]["line"].clone()),
                Some("exit") if is_process => exited = true,
                _ => {}
            }
        }
    })
    .await
    .expect("Timed out waiting for aggregated events");

    assert_eq!(ticket_files, vec![json!("T-1.md")]);
    assert_eq!(lines, vec![json!("from-process")]);
}

#[tokio::test]
async fn test_event_stream_without_project_ignores_ticket_topics() {
    let server = TestServer::start().await;

    let mut events = server.sse("/events?topics=tickets,progress").await;
    let first = collect_until(&mut events, |_| true).await;
    let connected = data(&first[0]);
    assert_eq!(connected["data"]["topics"], json!([]));
}

// ============================================================================
// Terminal Tests
// ============================================================================

#[tokio::test]
async fn test_terminal_two_viewers_share_output() {
    let server = TestServer::start().await;

    let mut a = server.connect_terminal("cols=100&rows=30&label=shared").await;
    let ready = next_of_type(&mut a, "ready").await;
    assert_eq!(ready["reattached"], false);
    let session_id = ready["sessionId"].as_str().unwrap().to_string();

    let mut b = server
        .connect_terminal(&format!("sessionId={}", session_id))
        .await;
    let ready = next_of_type(&mut b, "ready").await;
    assert_eq!(ready["reattached"], true);
    assert_eq!(ready["sessionId"], session_id.as_str());
    assert_eq!(server.state.terminal_service.count(), 1);

    send_json(
        &mut a,
        json!({ "type": "input", "data": "echo marker_$((40+2))\n" }),
    )
    .await;
    wait_for_output(&mut a, "marker_42").await;
    wait_for_output(&mut b, "marker_42").await;

    send_json(&mut b, json!({ "type": "list_sessions" })).await;
    let sessions = next_of_type(&mut b, "sessions").await;
    assert_eq!(sessions["sessions"][0]["id"], session_id.as_str());
    assert_eq!(sessions["sessions"][0]["label"], "shared");

    send_json(
        &mut a,
        json!({ "type": "close_session", "sessionId": session_id }),
    )
    .await;
    let closed = next_of_type(&mut b, "session_closed").await;
    assert_eq!(closed["sessionId"], session_id.as_str());
    let result = next_of_type(&mut a, "close_session_result").await;
    assert_eq!(result["success"], true);
    assert_eq!(server.state.terminal_service.count(), 0);
}

#[tokio::test]
async fn test_terminal_survives_viewer_disconnect() {
    let server = TestServer::start().await;

    let mut first = server.connect_terminal("").await;
    let ready = next_of_type(&mut first, "ready").await;
    let session_id = ready["sessionId"].as_str().unwrap().to_string();
    send_json(&mut first, json!({ "type": "input", "data": "X=kept\n" })).await;
    drop(first);

    // The server notices the disconnect asynchronously
    tokio::time::timeout(WAIT, async {
        loop {
            let orphaned = server
                .state
                .terminal_service
                .get(&session_id)
                .map(|s| s.is_orphaned())
                .unwrap_or(false);
            if orphaned {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session was not orphaned");

    let mut second = server
        .connect_terminal(&format!("sessionId={}", session_id))
        .await;
    let ready = next_of_type(&mut second, "ready").await;
    assert_eq!(ready["reattached"], true);

    send_json(&mut second, json!({ "type": "input", "data": "echo got_$X\n" })).await;
    wait_for_output(&mut second, "got_kept").await;

    send_json(
        &mut second,
        json!({ "type": "close_session", "sessionId": session_id }),
    )
    .await;
}

#[tokio::test]
async fn test_terminal_malformed_message_keeps_connection() {
    let server = TestServer::start().await;

    let mut socket = server.connect_terminal("").await;
    let ready = next_of_type(&mut socket, "ready").await;
    let session_id = ready["sessionId"].as_str().unwrap().to_string();

    send_json(&mut socket, json!({ "type": "teleport" })).await;
    let error = next_of_type(&mut socket, "error").await;
    assert!(error["message"].as_str().unwrap().starts_with("Invalid message"));

    send_json(&mut socket, json!({ "type": "input", "data": "echo still_$((1+1))\n" })).await;
    wait_for_output(&mut socket, "still_2").await;

    send_json(
        &mut socket,
        json!({ "type": "close_session", "sessionId": session_id }),
    )
    .await;
}

#[tokio::test]
async fn test_terminal_session_cap() {
    let server = TestServer::with_config(opsdeck_server::Config {
        max_terminal_sessions: 1,
        ..test_config()
    })
    .await;

    let mut first = server.connect_terminal("").await;
    let ready = next_of_type(&mut first, "ready").await;
    let session_id = ready["sessionId"].as_str().unwrap().to_string();

    let mut second = server.connect_terminal("").await;
    let error = next_of_type(&mut second, "error").await;
    assert!(error["message"].as_str().unwrap().contains("max sessions"));
    assert!(next_json(&mut second).await.is_none());

    send_json(
        &mut first,
        json!({ "type": "close_session", "sessionId": session_id }),
    )
    .await;
}

#[tokio::test]
async fn test_terminal_exit_is_reported() {
    let server = TestServer::start().await;

    let mut socket = server.connect_terminal("").await;
    next_of_type(&mut socket, "ready").await;
    send_json(&mut socket, json!({ "type": "input", "data": "exit 5\n" })).await;

    let exit = next_of_type(&mut socket, "exit").await;
    assert_eq!(exit["code"], 5);
    assert!(next_json(&mut socket).await.is_none());
    assert_eq!(server.state.terminal_service.count(), 0);
}

#[tokio::test]
async fn test_terminal_refuses_remote_peer() {
    let peer = "192.168.1.20:50000".parse().unwrap();
    let server = TestServer::with_peer(test_config(), peer).await;

    let mut socket = server.connect_terminal("").await;
    let (code, reason) = next_close(&mut socket).await.expect("close frame without a code");
    assert_eq!(code, opsdeck_server::api::http::REMOTE_REFUSED_CLOSE_CODE);
    assert_eq!(code, 4003);
    assert_eq!(reason, "remote connections are disabled");
    assert_eq!(server.state.terminal_service.count(), 0);
}

#[tokio::test]
async fn test_terminal_remote_peer_allowed_with_opt_in() {
    let peer = "192.168.1.20:50000".parse().unwrap();
    let server = TestServer::with_peer(
        opsdeck_server::Config {
            allow_remote_terminal: true,
            ..test_config()
        },
        peer,
    )
    .await;

    let mut socket = server.connect_terminal("").await;
    let ready = next_of_type(&mut socket, "ready").await;
    let session_id = ready["sessionId"].as_str().unwrap().to_string();

    send_json(
        &mut socket,
        json!({ "type": "close_session", "sessionId": session_id }),
    )
    .await;
    next_of_type(&mut socket, "close_session_result").await;
}

// ============================================================================
// Client Tests
// ============================================================================

#[tokio::test]
async fn test_client_follows_process_to_completion() {
    let server = TestServer::start().await;
    let api = Arc::new(HttpProcessApi::new(server.base_url()).unwrap());
    let tracker = Arc::new(ProcessTracker::new());
    let controller = ProcessController::new(api.clone(), tracker.clone());

    let handle = controller
        .start("echo one; echo two >&2; exit 3", None)
        .await
        .unwrap();

    let (events, stream_task) = EventStream::new(server.base_url(), vec![process_topic(&handle.id)])
        .with_reconnect_delay(Duration::from_millis(100))
        .spawn();
    let code = tokio::time::timeout(
        WAIT,
        controller.follow(receiver_stream(events)),
    )
    .await
    .expect("Timed out following process")
    .unwrap();
    stream_task.abort();

    assert_eq!(code, Some(3));
    let state = tracker.state();
    let mut lines: Vec<_> = state.lines().iter().map(|l| l.line.clone()).collect();
    lines.sort();
    assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);

    assert_eq!(
        api.status(&handle.id).await.unwrap(),
        opsdeck_client::types::ProcessStatus::Exited { code: Some(3) }
    );
    let err = api.kill(&handle.id).await.unwrap_err();
    assert!(matches!(
        err,
        opsdeck_client::ClientError::Status { code: 409, .. }
    ));
}

fn receiver_stream(
    rx: tokio::sync::mpsc::Receiver<opsdeck_client::types::TopicEvent>,
) -> impl futures_util::Stream<Item = opsdeck_client::types::TopicEvent> + Unpin {
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    }))
}
