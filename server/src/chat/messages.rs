//! Message fanout: validate, persist, deliver, update the directory.
//!
//! Sends to one session are serialized by that session's lock, which is held
//! across persistence and delivery. Every recipient therefore observes a
//! session's messages in persistence order, while other sessions proceed in
//! parallel.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::chat::directory;
use crate::chat::error::ChatError;
use crate::chat::models::{ChatAttachment, ChatMessage, NewMessage, Sender};
use crate::state::{AppState, ChatLimits};
use crate::ws::broadcast::encode;
use crate::ws::protocol::ServerEvent;

/// Default page size for message history.
const DEFAULT_LIMIT: u32 = 50;
/// Maximum page size for message history.
const MAX_LIMIT: u32 = 100;

/// A message as received from a connection, before validation.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub session_id: String,
    pub sender: Sender,
    pub sender_admin_id: Option<String>,
    pub text: String,
    pub attachments: Vec<ChatAttachment>,
}

impl OutgoingMessage {
    /// Check content against the configured limits. Text is trimmed; a
    /// message needs text or at least one attachment.
    pub fn validate(self, limits: &ChatLimits) -> Result<NewMessage, ChatError> {
        let text = self.text.trim().to_string();

        if text.is_empty() && self.attachments.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if text.chars().count() > limits.max_message_length {
            return Err(ChatError::MessageTooLong {
                max: limits.max_message_length,
            });
        }
        if self.attachments.len() > limits.max_attachments {
            return Err(ChatError::TooManyAttachments {
                max: limits.max_attachments,
            });
        }
        if let Some(bad) = self.attachments.iter().find(|a| a.url.trim().is_empty()) {
            return Err(ChatError::InvalidAttachment(bad.id.clone()));
        }

        Ok(NewMessage {
            session_id: self.session_id,
            sender: self.sender,
            sender_admin_id: self.sender_admin_id,
            text,
            attachments: self.attachments,
        })
    }
}

/// Deliver a stored message to every connection of every joined admin and
/// to the session's visitor connections.
fn fan_out(state: &AppState, message: &ChatMessage) -> usize {
    let Some(msg) = encode(&ServerEvent::Message(message.clone())) else {
        return 0;
    };

    let members = state.rosters.members(&message.session_id);
    for admin_id in &members {
        state.connections.send_to_admin(admin_id, &msg);
    }
    state.connections.send_to_visitors(&message.session_id, &msg);
    members.len()
}

/// `send`: validate, persist, fan out and publish the updated session.
///
/// Nothing is persisted or delivered when validation fails or the session is
/// unknown or closed.
pub async fn send_message(
    state: &AppState,
    outgoing: OutgoingMessage,
) -> Result<ChatMessage, ChatError> {
    let new = outgoing.validate(&state.limits)?;

    let _guard = state.session_locks.acquire(&new.session_id).await;

    let session = state
        .store
        .get_session(&new.session_id)
        .await?
        .ok_or(ChatError::SessionNotFound)?;
    if !session.is_open() {
        return Err(ChatError::SessionClosed);
    }

    let (message, session) = state.store.append_message(new).await?;

    let admins = fan_out(state, &message);
    directory::publish(state, session);

    tracing::debug!(
        session_id = %message.session_id,
        message_id = %message.id,
        sender = message.sender.as_str(),
        admins,
        "Message delivered"
    );

    Ok(message)
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub messages: Vec<ChatMessage>,
    pub has_more: bool,
}

/// GET /chat/sessions/{session_id}/messages?limit={n}
/// Most recent messages of a session in creation order.
pub async fn get_session_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, StatusCode> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    if state
        .store
        .get_session(&session_id)
        .await
        .map_err(ChatError::from)?
        .is_none()
    {
        return Err(StatusCode::NOT_FOUND);
    }

    let (messages, has_more) = state
        .store
        .recent_messages(&session_id, limit)
        .await
        .map_err(ChatError::from)?;

    Ok(Json(HistoryResponse { messages, has_more }))
}
