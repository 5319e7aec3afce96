pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;

use axum::extract::ws::Message;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::chat::models::AdminIdentity;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

/// Process-unique id of one socket.
pub type ConnectionId = u64;

/// Who is on the other end of a socket.
#[derive(Debug, Clone)]
pub enum ConnectionRole {
    Admin(AdminIdentity),
    Visitor { session_id: String, visitor_id: String },
}

/// Returned by `connect_*` and required to disconnect.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub role: ConnectionRole,
}

impl ConnectionHandle {
    pub fn admin(&self) -> Option<&AdminIdentity> {
        match &self.role {
            ConnectionRole::Admin(identity) => Some(identity),
            ConnectionRole::Visitor { .. } => None,
        }
    }
}

/// Outcome of registering an admin connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminConnect {
    /// First live connection for this admin id.
    CameOnline,
    /// Another tab of an online admin, identity changed (name/avatar/color).
    IdentityChanged,
    /// Another tab of an online admin, nothing visible changed.
    AlreadyOnline,
}

#[derive(Debug)]
struct AdminEntry {
    /// Identity of the most recent connection.
    identity: AdminIdentity,
    connections: Vec<(ConnectionId, ConnectionSender)>,
}

/// Connection registry: tracks every live socket.
///
/// Admins are keyed by admin id; the number of live connections is the
/// reference count that decides online/offline. Visitors are keyed by the
/// session they chat in. A user can have multiple concurrent connections
/// (multiple devices/tabs).
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    admins: Arc<DashMap<String, AdminEntry>>,
    visitors: Arc<DashMap<String, Vec<(ConnectionId, ConnectionSender)>>>,
    next_id: Arc<AtomicU64>,
    presence_gate: Arc<Mutex<()>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Serializes presence transitions so that snapshot broadcasts leave in
    /// the same order as the mutations that produced them.
    pub fn presence_gate(&self) -> MutexGuard<'_, ()> {
        self.presence_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an admin connection. Duplicate ids are legal (multi-tab).
    pub fn connect_admin(
        &self,
        identity: AdminIdentity,
        sender: ConnectionSender,
    ) -> (ConnectionHandle, AdminConnect) {
        let id = self.allocate_id();
        let outcome = match self.admins.entry(identity.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let changed = entry.identity != identity;
                entry.identity = identity.clone();
                entry.connections.push((id, sender));
                if changed {
                    AdminConnect::IdentityChanged
                } else {
                    AdminConnect::AlreadyOnline
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(AdminEntry {
                    identity: identity.clone(),
                    connections: vec![(id, sender)],
                });
                AdminConnect::CameOnline
            }
        };

        tracing::debug!(
            admin_id = %identity.id,
            connection_id = id,
            connections = self.admin_connection_count(&identity.id),
            "Admin connection registered"
        );

        (
            ConnectionHandle {
                id,
                role: ConnectionRole::Admin(identity),
            },
            outcome,
        )
    }

    /// Register a visitor connection for a session.
    pub fn connect_visitor(
        &self,
        session_id: &str,
        visitor_id: &str,
        sender: ConnectionSender,
    ) -> ConnectionHandle {
        let id = self.allocate_id();
        self.visitors
            .entry(session_id.to_string())
            .or_default()
            .push((id, sender));

        tracing::debug!(
            session_id = %session_id,
            visitor_id = %visitor_id,
            connection_id = id,
            "Visitor connection registered"
        );

        ConnectionHandle {
            id,
            role: ConnectionRole::Visitor {
                session_id: session_id.to_string(),
                visitor_id: visitor_id.to_string(),
            },
        }
    }

    /// Remove a connection. Returns true when this was the admin's last
    /// connection, i.e. the admin went offline.
    pub fn disconnect(&self, handle: &ConnectionHandle) -> bool {
        match &handle.role {
            ConnectionRole::Admin(identity) => {
                let went_offline = self
                    .admins
                    .remove_if_mut(&identity.id, |_, entry| {
                        entry.connections.retain(|(id, _)| *id != handle.id);
                        entry.connections.is_empty()
                    })
                    .is_some();

                tracing::debug!(
                    admin_id = %identity.id,
                    connection_id = handle.id,
                    went_offline,
                    "Admin connection unregistered"
                );
                went_offline
            }
            ConnectionRole::Visitor { session_id, .. } => {
                self.visitors.remove_if_mut(session_id, |_, connections| {
                    connections.retain(|(id, _)| *id != handle.id);
                    connections.is_empty()
                });
                false
            }
        }
    }

    pub fn is_online(&self, admin_id: &str) -> bool {
        self.admins.contains_key(admin_id)
    }

    pub fn admin_connection_count(&self, admin_id: &str) -> usize {
        self.admins
            .get(admin_id)
            .map(|entry| entry.connections.len())
            .unwrap_or(0)
    }

    /// Last-seen identity of an online admin.
    pub fn identity(&self, admin_id: &str) -> Option<AdminIdentity> {
        self.admins.get(admin_id).map(|entry| entry.identity.clone())
    }

    /// Online admins, one per id, ordered by id.
    pub fn online_admins(&self) -> Vec<AdminIdentity> {
        let mut admins: Vec<AdminIdentity> = self
            .admins
            .iter()
            .map(|entry| entry.value().identity.clone())
            .collect();
        admins.sort_by(|a, b| a.id.cmp(&b.id));
        admins
    }

    /// Send to every connection of one admin.
    pub fn send_to_admin(&self, admin_id: &str, msg: &Message) {
        if let Some(entry) = self.admins.get(admin_id) {
            for (_, sender) in entry.connections.iter() {
                let _ = sender.send(msg.clone());
            }
        }
    }

    /// Send to every admin connection.
    pub fn send_to_all_admins(&self, msg: &Message) {
        for entry in self.admins.iter() {
            for (_, sender) in entry.value().connections.iter() {
                let _ = sender.send(msg.clone());
            }
        }
    }

    /// Send to every visitor connection of a session.
    pub fn send_to_visitors(&self, session_id: &str, msg: &Message) {
        if let Some(connections) = self.visitors.get(session_id) {
            for (_, sender) in connections.iter() {
                let _ = sender.send(msg.clone());
            }
        }
    }

    pub fn has_visitor(&self, session_id: &str) -> bool {
        self.visitors.contains_key(session_id)
    }

    /// Force-close every connection (graceful shutdown).
    pub fn close_all(&self, close_code: u16, reason: &str) {
        let frame = axum::extract::ws::CloseFrame {
            code: close_code,
            reason: reason.into(),
        };
        let msg = Message::Close(Some(frame));
        self.send_to_all_admins(&msg);
        for entry in self.visitors.iter() {
            for (_, sender) in entry.value().iter() {
                let _ = sender.send(msg.clone());
            }
        }
    }
}
