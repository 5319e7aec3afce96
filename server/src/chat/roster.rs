//! Which admins are viewing which session.
//!
//! Membership is booked per connection with a join count, so tabs join and
//! leave independently; the roster published on the wire is the distinct set
//! of admin ids with at least one live membership.

use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::chat::error::ChatError;
use crate::chat::models::AdminIdentity;
use crate::chat::typing::{self, ParticipantKey};
use crate::state::AppState;
use crate::ws::broadcast::{encode, send_event};
use crate::ws::protocol::ServerEvent;
use crate::ws::{ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionSender};

#[derive(Debug, Clone)]
struct Membership {
    admin_id: String,
    joins: u32,
}

/// State for a single session.
#[derive(Debug, Clone, Default)]
struct RosterState {
    joined: HashMap<ConnectionId, Membership>,
}

impl RosterState {
    fn admin_ids(&self) -> Vec<String> {
        self.joined
            .values()
            .map(|m| m.admin_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn has_admin(&self, admin_id: &str) -> bool {
        self.joined.values().any(|m| m.admin_id == admin_id)
    }
}

/// Result of removing a membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Roster after the leave.
    pub roster: Vec<String>,
    /// The admin has no membership left in the session.
    pub admin_left: bool,
}

/// In-memory session roster manager.
///
/// Tracks which admin connections are joined to which sessions using a DashMap;
/// callbacks passed to the mutating methods run under the session's entry lock.
#[derive(Debug, Clone, Default)]
pub struct SessionRosters {
    /// session_id -> RosterState
    sessions: Arc<DashMap<String, RosterState>>,
}

impl SessionRosters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a session from one connection. `publish` receives the new roster.
    pub fn join<F>(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
        admin_id: &str,
        publish: F,
    ) -> Vec<String>
    where
        F: FnOnce(&[String]),
    {
        let mut entry = self.sessions.entry(session_id.to_string()).or_default();
        let state = entry.value_mut();

        state
            .joined
            .entry(connection_id)
            .or_insert_with(|| Membership {
                admin_id: admin_id.to_string(),
                joins: 0,
            })
            .joins += 1;

        let roster = state.admin_ids();
        publish(&roster);
        roster
    }

    /// Leave a session. The connection's own membership is decremented first;
    /// failing that, any membership the admin holds through another tab.
    /// `publish` receives the roster after the leave.
    pub fn leave<F>(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
        admin_id: &str,
        publish: F,
    ) -> LeaveOutcome
    where
        F: FnOnce(&[String]),
    {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            publish(&[]);
            return LeaveOutcome {
                roster: Vec::new(),
                admin_left: true,
            };
        };
        let state = entry.value_mut();

        let target = if state.joined.contains_key(&connection_id) {
            Some(connection_id)
        } else {
            state
                .joined
                .iter()
                .filter(|(_, m)| m.admin_id == admin_id)
                .map(|(id, _)| *id)
                .min()
        };

        if let Some(target) = target {
            if let Some(membership) = state.joined.get_mut(&target) {
                membership.joins = membership.joins.saturating_sub(1);
                if membership.joins == 0 {
                    state.joined.remove(&target);
                }
            }
        }

        let outcome = LeaveOutcome {
            roster: state.admin_ids(),
            admin_left: !state.has_admin(admin_id),
        };
        publish(&outcome.roster);

        // Clean up empty sessions
        if state.joined.is_empty() {
            drop(entry);
            self.sessions.remove_if(session_id, |_, s| s.joined.is_empty());
        }

        outcome
    }

    /// Drop every membership of a closed connection.
    ///
    /// `publish` runs for each session whose roster changed. Returns the
    /// `(session_id, admin_id)` pairs where the admin is no longer present.
    pub fn drop_connection<F>(
        &self,
        connection_id: ConnectionId,
        mut publish: F,
    ) -> Vec<(String, String)>
    where
        F: FnMut(&str, &[String]),
    {
        let mut departed = Vec::new();

        // Collect session IDs first to avoid holding locks during mutation
        let session_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();

        for session_id in session_ids {
            if let Some(mut entry) = self.sessions.get_mut(&session_id) {
                let Some(membership) = entry.joined.remove(&connection_id) else {
                    continue;
                };
                if !entry.has_admin(&membership.admin_id) {
                    publish(&session_id, &entry.admin_ids());
                    departed.push((session_id.clone(), membership.admin_id));
                }
                if entry.joined.is_empty() {
                    drop(entry);
                    self.sessions.remove_if(&session_id, |_, s| s.joined.is_empty());
                }
            }
        }

        departed
    }

    /// Distinct admin ids joined to a session.
    pub fn members(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.admin_ids())
            .unwrap_or_default()
    }

    pub fn contains(&self, session_id: &str, admin_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|entry| entry.has_admin(admin_id))
            .unwrap_or(false)
    }

    /// Sessions an admin is joined to through any connection.
    pub fn sessions_of(&self, admin_id: &str) -> Vec<String> {
        let mut sessions: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().has_admin(admin_id))
            .map(|entry| entry.key().clone())
            .collect();
        sessions.sort();
        sessions
    }
}

/// Resolve roster ids to the identities currently registered for them.
pub fn roster_identities(registry: &ConnectionRegistry, admin_ids: &[String]) -> Vec<AdminIdentity> {
    admin_ids
        .iter()
        .filter_map(|id| registry.identity(id))
        .collect()
}

/// Send `sessionAdmins` to every member of the roster.
fn publish_roster(
    registry: &ConnectionRegistry,
    session_id: &str,
    admin_ids: &[String],
) {
    let event = ServerEvent::SessionAdmins {
        session_id: session_id.to_string(),
        admins: roster_identities(registry, admin_ids),
    };
    let Some(msg) = encode(&event) else {
        return;
    };
    for admin_id in admin_ids {
        registry.send_to_admin(admin_id, &msg);
    }
}

/// `joinSession`: register membership and broadcast the roster to the session.
pub fn join_session(
    state: &AppState,
    conn: &ConnectionHandle,
    admin: &AdminIdentity,
    tx: &ConnectionSender,
    session_id: &str,
) -> Result<Vec<AdminIdentity>, ChatError> {
    if !state.directory.contains(session_id) {
        return Err(ChatError::SessionNotFound);
    }

    let roster = state
        .rosters
        .join(session_id, conn.id, &admin.id, |roster| {
            publish_roster(&state.connections, session_id, roster)
        });

    tracing::debug!(
        admin_id = %admin.id,
        session_id = %session_id,
        roster_size = roster.len(),
        "Admin joined session"
    );

    // Catch the new viewer up on who is typing.
    typing::send_current_view(state, session_id, &admin.id, tx);

    Ok(roster_identities(&state.connections, &roster))
}

/// `leaveSession`: drop membership, clear the admin's typing state, broadcast the roster
/// to the remaining members and to the leaving connection.
pub fn leave_session(
    state: &AppState,
    conn: &ConnectionHandle,
    admin: &AdminIdentity,
    tx: &ConnectionSender,
    session_id: &str,
) {
    let outcome = state
        .rosters
        .leave(session_id, conn.id, &admin.id, |roster| {
            publish_roster(&state.connections, session_id, roster)
        });

    if !outcome.roster.contains(&admin.id) {
        send_event(
            tx,
            &ServerEvent::SessionAdmins {
                session_id: session_id.to_string(),
                admins: roster_identities(&state.connections, &outcome.roster),
            },
        );
    }

    typing::set_typing(
        state,
        session_id,
        ParticipantKey::Admin(admin.id.clone()),
        false,
    );

    tracing::debug!(
        admin_id = %admin.id,
        session_id = %session_id,
        admin_left = outcome.admin_left,
        "Admin left session"
    );
}

/// Implicit leave for a dropped connection.
pub fn connection_closed(state: &AppState, conn: &ConnectionHandle) {
    let departed = state.rosters.drop_connection(conn.id, |session_id, roster| {
        publish_roster(&state.connections, session_id, roster)
    });

    for (session_id, admin_id) in departed {
        typing::set_typing(state, &session_id, ParticipantKey::Admin(admin_id), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_tracks_join_minus_leave_per_admin() {
        let rosters = SessionRosters::new();

        rosters.join("s1", 1, "alice", |_| {});
        rosters.join("s1", 2, "bob", |_| {});
        rosters.join("s1", 1, "alice", |_| {});
        assert_eq!(rosters.members("s1"), vec!["alice", "bob"]);

        let outcome = rosters.leave("s1", 1, "alice", |_| {});
        assert!(!outcome.admin_left);
        assert_eq!(outcome.roster, vec!["alice", "bob"]);

        let outcome = rosters.leave("s1", 1, "alice", |_| {});
        assert!(outcome.admin_left);
        assert_eq!(outcome.roster, vec!["bob"]);

        let mut last = Vec::new();
        rosters.leave("s1", 2, "bob", |roster| last = roster.to_vec());
        assert!(last.is_empty());
        assert!(rosters.members("s1").is_empty());
    }

    #[test]
    fn tabs_join_independently() {
        let rosters = SessionRosters::new();
        rosters.join("s1", 1, "alice", |_| {});
        rosters.join("s1", 2, "alice", |_| {});

        // A leave from a tab that never joined still counts against the admin.
        let outcome = rosters.leave("s1", 3, "alice", |_| {});
        assert!(!outcome.admin_left);
        let outcome = rosters.leave("s1", 3, "alice", |_| {});
        assert!(outcome.admin_left);
    }

    #[test]
    fn dropped_connection_leaves_every_session() {
        let rosters = SessionRosters::new();
        rosters.join("s1", 1, "alice", |_| {});
        rosters.join("s2", 1, "alice", |_| {});
        rosters.join("s2", 2, "alice", |_| {});
        rosters.join("s2", 3, "bob", |_| {});

        let mut published = Vec::new();
        let mut departed = rosters.drop_connection(1, |session_id, roster| {
            published.push((session_id.to_string(), roster.to_vec()))
        });
        departed.sort();

        // alice is still in s2 through connection 2, so only s1 changed.
        assert_eq!(departed, vec![("s1".to_string(), "alice".to_string())]);
        assert_eq!(published, vec![("s1".to_string(), Vec::<String>::new())]);
        assert_eq!(rosters.sessions_of("alice"), vec!["s2"]);
        assert!(rosters.contains("s2", "bob"));
    }
}
