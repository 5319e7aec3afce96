//! Admin presence: online/offline transitions and snapshot broadcast.
//!
//! The connection registry keeps the per-id reference count. Every 0→1 and
//! 1→0 transition sends the full online list to all admin connections.
//! Transitions and their broadcasts run under the registry's presence gate,
//! so snapshots leave in the order the mutations happened.

use axum::{extract::State, Json};

use crate::chat::models::AdminIdentity;
use crate::state::AppState;
use crate::ws::broadcast::{broadcast_to_admins, send_event};
use crate::ws::protocol::ServerEvent;
use crate::ws::{AdminConnect, ConnectionHandle, ConnectionSender};

fn snapshot(state: &AppState) -> ServerEvent {
    ServerEvent::AdminPresence {
        admins: state.connections.online_admins(),
    }
}

// --- Functions called from WS actor lifecycle ---

/// Register an admin connection and publish presence.
///
/// A newly online admin (or a changed identity) triggers a broadcast to every
/// admin; an extra tab of an unchanged admin only gets its own snapshot.
pub fn admin_connected(
    state: &AppState,
    identity: AdminIdentity,
    tx: ConnectionSender,
) -> ConnectionHandle {
    let _gate = state.connections.presence_gate();

    let (handle, outcome) = state.connections.connect_admin(identity, tx.clone());
    match outcome {
        AdminConnect::CameOnline | AdminConnect::IdentityChanged => {
            broadcast_to_admins(&state.connections, &snapshot(state));
        }
        AdminConnect::AlreadyOnline => send_event(&tx, &snapshot(state)),
    }

    if outcome == AdminConnect::CameOnline {
        if let Some(admin) = handle.admin() {
            tracing::info!(admin_id = %admin.id, name = %admin.name, "Admin came online");
        }
    }

    handle
}

/// Unregister an admin connection. Returns true when the admin went offline,
/// in which case the remaining admins got a fresh snapshot.
pub fn admin_disconnected(state: &AppState, handle: &ConnectionHandle) -> bool {
    let _gate = state.connections.presence_gate();

    let went_offline = state.connections.disconnect(handle);
    if went_offline {
        broadcast_to_admins(&state.connections, &snapshot(state));
        if let Some(admin) = handle.admin() {
            tracing::info!(admin_id = %admin.id, "Admin went offline");
        }
    }
    went_offline
}

// --- REST endpoint handlers ---

/// GET /chat/presence — online admins, one entry per id.
pub async fn get_presence(State(state): State<AppState>) -> Json<Vec<AdminIdentity>> {
    Json(state.connections.online_admins())
}
