//! Terminal WebSocket handler

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::terminal::{ConnectParams, ServerMessage};
use crate::service::terminal::VIEWER_QUEUE;
use crate::AppState;

/// Close code sent to refused non-loopback peers
pub const REMOTE_REFUSED_CLOSE_CODE: u16 = 4003;

/// WebSocket handler for interactive terminals
pub async fn terminal_websocket(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let allowed = peer_allowed(peer.ip(), state.config.allow_remote_terminal);
    ws.on_upgrade(move |socket| async move {
        if allowed {
            handle_terminal_socket(socket, state, params, peer).await
        } else {
            refuse_remote(socket, peer).await
        }
    })
}

/// Loopback peers are always allowed; others only with the remote opt-in
fn peer_allowed(ip: IpAddr, allow_remote: bool) -> bool {
    let loopback = match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(v6.is_loopback(), |v4| v4.is_loopback()),
    };
    loopback || allow_remote
}

async fn refuse_remote(mut socket: WebSocket, peer: SocketAddr) {
    warn!("Refusing terminal connection from {}", peer);
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: REMOTE_REFUSED_CLOSE_CODE,
            reason: "remote connections are disabled".into(),
        })))
        .await;
}

async fn handle_terminal_socket(
    mut socket: WebSocket,
    state: AppState,
    params: ConnectParams,
    peer: SocketAddr,
) {
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(VIEWER_QUEUE);

    let attachment = match state.terminal_service.connect(&params, tx).await {
        Ok(attachment) => attachment,
        Err(e) => {
            warn!("Terminal connection from {} failed: {}", peer, e);
            let error = ServerMessage::Error {
                message: e.to_string(),
            };
            if let Ok(text) = serde_json::to_string(&error) {
                let _ = socket.send(Message::Text(text.into())).await;
            }
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    info!(
        "Terminal viewer {} from {} attached to session {} (reattached: {})",
        attachment.viewer_id, peer, attachment.session.id, attachment.reattached
    );

    let (mut sender, mut receiver) = socket.split();

    // The queue closes when the session ends or this viewer is dropped for
    // falling behind; either way the socket is closed after the last message.
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode terminal message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state.terminal_service.handle_text(&attachment, text.as_str());
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = state.terminal_service.input(&attachment.session.id, &data) {
                        attachment.reply(ServerMessage::Error { message: e.to_string() });
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Terminal socket error from {}: {}", peer, e);
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    state.terminal_service.detach(&attachment);
    writer.abort();
    info!(
        "Terminal viewer {} detached from session {}",
        attachment.viewer_id, attachment.session.id
    );
}
