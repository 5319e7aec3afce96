use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout};

use crate::chat::models::AdminIdentity;
use crate::chat::typing::{self, ParticipantKey};
use crate::chat::{presence, roster};
use crate::state::AppState;
use crate::ws::broadcast::send_event;
use crate::ws::protocol::{self, ServerEvent};
use crate::ws::{ConnectionHandle, ConnectionRole};

/// Who a validated handshake belongs to.
#[derive(Debug, Clone)]
pub enum Participant {
    Admin(AdminIdentity),
    Visitor {
        session_id: String,
        visitor_id: String,
    },
}

/// Run the actor-per-connection pattern for a WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader task: processes incoming messages, dispatches to protocol handlers
///
/// The mpsc channel allows any part of the system to send messages to this client
/// by cloning the sender.
pub async fn run_connection(socket: WebSocket, state: AppState, participant: Participant) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Register before the writer starts so nothing sent to us is lost;
    // the channel buffers until the writer drains it.
    let conn = match participant {
        Participant::Admin(identity) => {
            // Presence snapshot goes out as part of registration.
            let handle = presence::admin_connected(&state, identity, tx.clone());
            send_event(
                &tx,
                &ServerEvent::SessionDirectory {
                    sessions: state.directory.list(),
                },
            );
            handle
        }
        Participant::Visitor {
            session_id,
            visitor_id,
        } => state
            .connections
            .connect_visitor(&session_id, &visitor_id, tx.clone()),
    };

    tracing::info!(connection_id = conn.id, role = role_name(&conn), "WebSocket actor started");

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();
    // Fired by the ping task when the peer stops answering
    let (dead_tx, mut dead_rx) = oneshot::channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let heartbeat = state.heartbeat;
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(heartbeat.interval);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died, connection is gone
                break;
            }

            match timeout(heartbeat.timeout, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    let _ = dead_tx.send(());
                    break;
                }
            }
        }
    });

    // Reader loop: process incoming WebSocket messages until the peer goes
    // away or stops answering pings
    loop {
        let next = tokio::select! {
            next = ws_receiver.next() => next,
            _ = &mut dead_rx => {
                tracing::info!(connection_id = conn.id, "Peer unresponsive, dropping connection");
                break;
            }
        };

        match next {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_message(text.as_str(), &conn, &tx, &state).await;
                }
                Message::Binary(data) => {
                    tracing::debug!(
                        connection_id = conn.id,
                        bytes = data.len(),
                        "Ignoring binary frame (protocol is JSON text)"
                    );
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        connection_id = conn.id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    connection_id = conn.id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(connection_id = conn.id, "WebSocket stream ended");
                break;
            }
        }
    }

    // Cleanup: abort writer and ping tasks
    writer_handle.abort();
    ping_handle.abort();

    connection_closed(&state, &conn);

    tracing::info!(connection_id = conn.id, role = role_name(&conn), "WebSocket actor stopped");
}

fn role_name(conn: &ConnectionHandle) -> &'static str {
    match conn.role {
        ConnectionRole::Admin(_) => "admin",
        ConnectionRole::Visitor { .. } => "visitor",
    }
}

/// Cleanup cascade for a dropped socket: rosters and typing first, then the
/// registry, so the offline snapshot never lists an admin still on a roster.
fn connection_closed(state: &AppState, conn: &ConnectionHandle) {
    match &conn.role {
        ConnectionRole::Admin(_) => {
            roster::connection_closed(state, conn);
            presence::admin_disconnected(state, conn);
        }
        ConnectionRole::Visitor { session_id, .. } => {
            state.connections.disconnect(conn);
            if !state.connections.has_visitor(session_id) {
                typing::set_typing(state, session_id, ParticipantKey::Visitor, false);
            }
        }
    }
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}
