use axum::extract::ws::Message;

use super::protocol::ServerEvent;
use super::{ConnectionRegistry, ConnectionSender};

/// Encode an event as a JSON text frame. Returns None (and logs) if encoding fails.
pub fn encode(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode server event");
            None
        }
    }
}

/// Send an event to a single connection.
pub fn send_event(tx: &ConnectionSender, event: &ServerEvent) {
    if let Some(msg) = encode(event) {
        let _ = tx.send(msg);
    }
}

/// Broadcast an event to every connected admin.
pub fn broadcast_to_admins(registry: &ConnectionRegistry, event: &ServerEvent) {
    if let Some(msg) = encode(event) {
        registry.send_to_all_admins(&msg);
    }
}

/// Send an error to the originating connection only.
pub fn send_chat_error(tx: &ConnectionSender, message: impl Into<String>) {
    send_event(
        tx,
        &ServerEvent::ChatError {
            message: message.into(),
        },
    );
}
