use serde::{Deserialize, Serialize};

use crate::chat::error::ChatError;
use crate::chat::models::{AdminIdentity, ChatAttachment, ChatMessage, ChatSession, Sender};
use crate::chat::typing::{ParticipantKey, TypingEvent};
use crate::chat::{messages, roster, typing};
use crate::state::AppState;
use crate::ws::broadcast::send_chat_error;
use crate::ws::{ConnectionHandle, ConnectionRole, ConnectionSender};

/// Events a client may send. Frames look like `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinSession {
        session_id: String,
    },
    LeaveSession {
        session_id: String,
    },
    Message {
        /// Visitors may omit it; their connection is bound to one session.
        #[serde(default)]
        session_id: Option<String>,
        /// Informational only. The connection's role decides the sender.
        #[serde(default)]
        sender: Option<Sender>,
        #[serde(default)]
        text: String,
        #[serde(default)]
        attachments: Vec<ChatAttachment>,
    },
    Typing {
        #[serde(default)]
        session_id: Option<String>,
        is_typing: bool,
    },
}

/// Events the server pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// One directory entry changed.
    SessionUpdated(ChatSession),
    /// Full directory, most recently active first.
    SessionDirectory { sessions: Vec<ChatSession> },
    /// Full online snapshot.
    AdminPresence { admins: Vec<AdminIdentity> },
    /// Roster of one session.
    SessionAdmins {
        session_id: String,
        admins: Vec<AdminIdentity>,
    },
    Typing(TypingEvent),
    Message(ChatMessage),
    ChatError { message: String },
}

/// Handle an incoming text frame: decode the event and dispatch it.
pub async fn handle_text_message(
    text: &str,
    conn: &ConnectionHandle,
    tx: &ConnectionSender,
    state: &AppState,
) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(
                connection_id = conn.id,
                error = %e,
                "Failed to decode client event"
            );
            send_chat_error(tx, "Invalid event");
            return;
        }
    };

    if let Err(err) = dispatch_event(event, conn, tx, state).await {
        match &err {
            ChatError::Store(source) => tracing::error!(
                connection_id = conn.id,
                error = %source,
                "Store failure while handling client event"
            ),
            other => tracing::debug!(
                connection_id = conn.id,
                error = %other,
                "Rejected client event"
            ),
        }
        send_chat_error(tx, err.to_string());
    }
}

/// Dispatch a decoded event according to the connection's role.
async fn dispatch_event(
    event: ClientEvent,
    conn: &ConnectionHandle,
    tx: &ConnectionSender,
    state: &AppState,
) -> Result<(), ChatError> {
    match (&conn.role, event) {
        (ConnectionRole::Admin(admin), ClientEvent::JoinSession { session_id }) => {
            roster::join_session(state, conn, admin, tx, &session_id)?;
        }
        (ConnectionRole::Admin(admin), ClientEvent::LeaveSession { session_id }) => {
            roster::leave_session(state, conn, admin, tx, &session_id);
        }
        (
            ConnectionRole::Admin(admin),
            ClientEvent::Message {
                session_id,
                text,
                attachments,
                ..
            },
        ) => {
            let session_id = session_id.ok_or(ChatError::SessionNotFound)?;
            messages::send_message(
                state,
                messages::OutgoingMessage {
                    session_id,
                    sender: Sender::Admin,
                    sender_admin_id: Some(admin.id.clone()),
                    text,
                    attachments,
                },
            )
            .await?;
        }
        (
            ConnectionRole::Admin(admin),
            ClientEvent::Typing {
                session_id,
                is_typing,
            },
        ) => {
            let session_id = session_id.ok_or(ChatError::SessionNotFound)?;
            typing::set_typing(
                state,
                &session_id,
                ParticipantKey::Admin(admin.id.clone()),
                is_typing,
            );
        }
        (
            ConnectionRole::Visitor { session_id, .. },
            ClientEvent::Message {
                text, attachments, ..
            },
        ) => {
            messages::send_message(
                state,
                messages::OutgoingMessage {
                    session_id: session_id.clone(),
                    sender: Sender::Visitor,
                    sender_admin_id: None,
                    text,
                    attachments,
                },
            )
            .await?;
        }
        (ConnectionRole::Visitor { session_id, .. }, ClientEvent::Typing { is_typing, .. }) => {
            typing::set_typing(state, session_id, ParticipantKey::Visitor, is_typing);
        }
        (ConnectionRole::Visitor { .. }, _) => return Err(ChatError::NotPermitted),
    }

    Ok(())
}
