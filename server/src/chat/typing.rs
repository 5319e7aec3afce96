//! Typing indicators.
//!
//! Server-side state is a per-session map of participant → deadline. An entry
//! past its deadline counts as "not typing" even before the sweep removes it,
//! so a client that vanished mid-keystroke cannot leave a stuck indicator.
//!
//! Broadcasts are per recipient: every joined admin gets the admin aggregate
//! with itself left out.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::chat::models::{AdminIdentity, Sender};
use crate::state::AppState;
use crate::ws::broadcast::{encode, send_event};
use crate::ws::protocol::ServerEvent;
use crate::ws::ConnectionSender;

/// Default deadline after the last `isTyping=true`, matching the widget's debounce.
pub const DEFAULT_TYPING_TTL: Duration = Duration::from_millis(1600);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParticipantKey {
    Visitor,
    Admin(String),
}

/// `typing` payload as seen by one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub session_id: String,
    pub role: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub is_typing: bool,
    /// Two or more admins are typing; names are withheld.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub multiple: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

/// Who is typing in one session at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypingSnapshot {
    pub visitor: bool,
    /// Sorted admin ids.
    pub admin_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct SessionTyping {
    deadlines: HashMap<ParticipantKey, Instant>,
}

impl SessionTyping {
    fn snapshot(&self, now: Instant) -> TypingSnapshot {
        let mut snapshot = TypingSnapshot::default();
        for (key, deadline) in &self.deadlines {
            if *deadline <= now {
                continue;
            }
            match key {
                ParticipantKey::Visitor => snapshot.visitor = true,
                ParticipantKey::Admin(id) => snapshot.admin_ids.push(id.clone()),
            }
        }
        snapshot.admin_ids.sort();
        snapshot
    }
}

/// Keyed-map-with-TTL of typing participants, one entry per session.
#[derive(Debug, Clone)]
pub struct TypingTracker {
    sessions: Arc<DashMap<String, SessionTyping>>,
    ttl: Duration,
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_TTL)
    }
}

impl TypingTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Upsert (`true`, fresh deadline) or delete (`false`) a typing entry.
    ///
    /// `publish` runs under the session's entry lock, and only when what
    /// recipients were last told changes: a refresh of an existing entry is
    /// silent. Returns whether `publish` ran.
    pub fn set_typing<F>(
        &self,
        session_id: &str,
        key: ParticipantKey,
        is_typing: bool,
        now: Instant,
        publish: F,
    ) -> bool
    where
        F: FnOnce(&TypingSnapshot),
    {
        if !is_typing && !self.sessions.contains_key(session_id) {
            return false;
        }

        let mut entry = self.sessions.entry(session_id.to_string()).or_default();
        let state = entry.value_mut();

        let changed = if is_typing {
            // An expired leftover may already have been reported as stopped.
            state
                .deadlines
                .insert(key, now + self.ttl)
                .map_or(true, |previous| previous <= now)
        } else {
            state.deadlines.remove(&key).is_some()
        };

        if changed {
            publish(&state.snapshot(now));
        }

        if state.deadlines.is_empty() {
            drop(entry);
            self.sessions.remove_if(session_id, |_, s| s.deadlines.is_empty());
        }

        changed
    }

    /// Remove every entry past its deadline; `publish` runs once per affected
    /// session under that session's lock. Returns the number of expired entries.
    pub fn sweep<F>(&self, now: Instant, mut publish: F) -> usize
    where
        F: FnMut(&str, &TypingSnapshot),
    {
        let mut expired = 0;

        // Collect session IDs first to avoid holding locks during mutation
        let session_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();

        for session_id in session_ids {
            if let Some(mut entry) = self.sessions.get_mut(&session_id) {
                let before = entry.deadlines.len();
                entry.deadlines.retain(|_, deadline| *deadline > now);
                let removed = before - entry.deadlines.len();
                if removed > 0 {
                    expired += removed;
                    publish(&session_id, &entry.snapshot(now));
                }
                if entry.deadlines.is_empty() {
                    drop(entry);
                    self.sessions
                        .remove_if(&session_id, |_, s| s.deadlines.is_empty());
                }
            }
        }

        expired
    }

    /// Run `view` on the current snapshot under the session's entry lock, so
    /// no concurrent change can publish between the read and the send.
    pub fn with_snapshot<F>(&self, session_id: &str, now: Instant, view: F)
    where
        F: FnOnce(&TypingSnapshot),
    {
        let entry = self.sessions.entry(session_id.to_string()).or_default();
        view(&entry.snapshot(now));

        if entry.deadlines.is_empty() {
            drop(entry);
            self.sessions.remove_if(session_id, |_, s| s.deadlines.is_empty());
        }
    }

    pub fn snapshot(&self, session_id: &str, now: Instant) -> TypingSnapshot {
        self.sessions
            .get(session_id)
            .map(|entry| entry.snapshot(now))
            .unwrap_or_default()
    }
}

/// The visitor half of a typing broadcast.
pub fn visitor_event(session_id: &str, is_typing: bool) -> TypingEvent {
    TypingEvent {
        session_id: session_id.to_string(),
        role: Sender::Visitor,
        admin_id: None,
        name: None,
        avatar: None,
        color: None,
        is_typing,
        multiple: false,
        count: None,
    }
}

/// Aggregate admin typers: none → not typing, one → named, more → "multiple".
pub fn admin_event(session_id: &str, typers: &[AdminIdentity]) -> TypingEvent {
    let mut event = TypingEvent {
        session_id: session_id.to_string(),
        role: Sender::Admin,
        admin_id: None,
        name: None,
        avatar: None,
        color: None,
        is_typing: !typers.is_empty(),
        multiple: false,
        count: None,
    };

    match typers {
        [] => {}
        [single] => {
            event.admin_id = Some(single.id.clone());
            event.name = Some(single.name.clone());
            event.avatar = single.avatar.clone();
            event.color = Some(single.color.clone());
        }
        many => {
            event.multiple = true;
            event.count = Some(many.len());
        }
    }

    event
}

/// Push a snapshot to every joined admin (self excluded) and to the visitor side.
fn deliver(state: &AppState, session_id: &str, snapshot: &TypingSnapshot) {
    let typers: Vec<AdminIdentity> = snapshot
        .admin_ids
        .iter()
        .filter_map(|id| state.connections.identity(id))
        .collect();

    let Some(visitor_msg) = encode(&ServerEvent::Typing(visitor_event(
        session_id,
        snapshot.visitor,
    ))) else {
        return;
    };

    for member in state.rosters.members(session_id) {
        let view: Vec<AdminIdentity> = typers
            .iter()
            .filter(|typer| typer.id != member)
            .cloned()
            .collect();
        if let Some(admin_msg) = encode(&ServerEvent::Typing(admin_event(session_id, &view))) {
            state.connections.send_to_admin(&member, &visitor_msg);
            state.connections.send_to_admin(&member, &admin_msg);
        }
    }

    if let Some(msg) = encode(&ServerEvent::Typing(admin_event(session_id, &typers))) {
        state.connections.send_to_visitors(session_id, &msg);
    }
}

/// Record a typing signal and broadcast if the visible state changed.
/// Signals for sessions the directory does not know are dropped.
pub fn set_typing(state: &AppState, session_id: &str, key: ParticipantKey, is_typing: bool) {
    if is_typing && !state.directory.contains(session_id) {
        tracing::debug!(session_id = %session_id, "Typing signal for unknown session ignored");
        return;
    }

    state
        .typing
        .set_typing(session_id, key, is_typing, Instant::now(), |snapshot| {
            deliver(state, session_id, snapshot)
        });
}

/// Send the current view of a session to one admin connection, e.g. right after joining.
pub fn send_current_view(
    state: &AppState,
    session_id: &str,
    admin_id: &str,
    tx: &ConnectionSender,
) {
    state
        .typing
        .with_snapshot(session_id, Instant::now(), |snapshot| {
            let view: Vec<AdminIdentity> = snapshot
                .admin_ids
                .iter()
                .filter(|id| id.as_str() != admin_id)
                .filter_map(|id| state.connections.identity(id))
                .collect();

            send_event(
                tx,
                &ServerEvent::Typing(visitor_event(session_id, snapshot.visitor)),
            );
            send_event(tx, &ServerEvent::Typing(admin_event(session_id, &view)));
        });
}

/// Spawn the background expiry sweep.
///
/// Every `interval`, entries past their deadline are dropped and the affected
/// sessions re-broadcast, so a typer that never sent `isTyping=false` is
/// cleared within ttl + interval.
pub fn spawn_typing_sweep(state: AppState, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let expired = state.typing.sweep(Instant::now(), |session_id, snapshot| {
                deliver(&state, session_id, snapshot)
            });
            if expired > 0 {
                tracing::debug!("Typing sweep: expired {} indicators", expired);
            }
        }
    })
}
