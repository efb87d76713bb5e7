use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::hub::{ConnectionHandle, OutboundFrame};
use crate::server::AppState;

use super::frame::{ClientFrame, ServerFrame};

/// WebSocket upgrade handler.
///
/// Authentication happens upstream of this service; the connection becomes a
/// session only once the client sends its identify frame.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection.
#[tracing::instrument(name = "ws.connection", skip(socket, state))]
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // The session does not exist until the client identifies itself
    let identify_timeout = Duration::from_secs(state.settings.websocket.identify_timeout);
    let user_id = match wait_for_identify(&mut ws_receiver, identify_timeout).await {
        Some(user_id) => user_id,
        None => {
            let frame = ServerFrame::error("IDENTIFY_REQUIRED", "Expected an identify frame");
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = ws_sender.send(Message::Text(text.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };

    // Channel for frames headed to this connection
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(state.settings.websocket.send_buffer);

    let handle = state.orchestrator.on_connect(&user_id, tx).await;
    let connection_id = handle.id;

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        "WebSocket session established"
    );

    // Writer: drain the outbound channel onto the socket
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Payload(text) => {
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close => {
                    let _ = ws_sender.close().await;
                    break;
                }
            }
        }
    });

    // Reader: apply client frames until the socket closes
    let state_clone = state.clone();
    let handle_clone = handle.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &state_clone, &handle_clone).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
        }
        _ = recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
        }
    }

    state.orchestrator.on_disconnect(&user_id, connection_id).await;

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        "WebSocket session closed"
    );
}

/// Wait for the identify handshake, discarding pings.
///
/// Returns None on timeout, close, malformed first frame, or any frame other
/// than identify.
async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    timeout: Duration,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let msg = match tokio::time::timeout_at(deadline, receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, "Receive error before identify");
                return None;
            }
            Ok(None) => return None,
            Err(_) => {
                tracing::warn!("Connection did not identify in time");
                return None;
            }
        };

        match msg {
            Message::Text(text) => {
                return match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Identify { user_id }) if !user_id.is_empty() => Some(user_id),
                    Ok(other) => {
                        tracing::warn!(frame = ?other, "Expected identify as first frame");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Malformed identify frame");
                        None
                    }
                };
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return None,
            Message::Binary(_) => {
                tracing::warn!("Binary frame before identify");
                return None;
            }
        }
    }
}

/// Process a received WebSocket message.
/// Returns false if the connection should be closed.
async fn process_message(msg: Message, state: &AppState, handle: &Arc<ConnectionHandle>) -> bool {
    match msg {
        Message::Text(text) => {
            let frame: ClientFrame = match serde_json::from_str(&text) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(
                        connection_id = %handle.id,
                        error = %e,
                        "Failed to parse client frame"
                    );
                    send_frame(handle, &ServerFrame::error("INVALID_MESSAGE", e.to_string()));
                    return true;
                }
            };
            handle_client_frame(frame, state, handle).await;
            true
        }
        Message::Binary(_) => {
            send_frame(
                handle,
                &ServerFrame::error("UNSUPPORTED_FORMAT", "Binary messages are not supported"),
            );
            true
        }
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.id, "Received close frame");
            false
        }
    }
}

#[tracing::instrument(
    name = "ws.frame",
    skip(state, handle),
    fields(connection_id = %handle.id, user_id = %handle.user_id)
)]
async fn handle_client_frame(frame: ClientFrame, state: &AppState, handle: &Arc<ConnectionHandle>) {
    match frame {
        ClientFrame::Identify { user_id } => {
            // Already identified; re-identifying mid-session is not supported
            tracing::warn!(
                connection_id = %handle.id,
                requested = %user_id,
                "Ignoring identify on an identified session"
            );
        }
        ClientFrame::OnlineConnections => {
            let users = state.orchestrator.hub().online_users();
            send_frame(handle, &ServerFrame::online_connections(users));
        }
        ClientFrame::JoinConversation { conversation_id } => {
            state
                .orchestrator
                .join_conversation(&handle.user_id, &conversation_id)
                .await;
        }
        ClientFrame::LeaveConversation { conversation_id } => {
            state
                .orchestrator
                .leave_conversation(&handle.user_id, &conversation_id)
                .await;
        }
    }
}

fn send_frame(handle: &Arc<ConnectionHandle>, frame: &ServerFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            if !handle.send(OutboundFrame::Payload(text)) {
                tracing::debug!(connection_id = %handle.id, "Dropped server frame, buffer closed");
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to serialize server frame"),
    }
}
