//! Ordered list of all sessions, pushed whole to every admin on change.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::chat::models::ChatSession;
use crate::state::AppState;
use crate::ws::broadcast::encode;
use crate::ws::protocol::ServerEvent;

/// Most recently active first; ties broken by id so the order is total.
fn by_activity(a: &ChatSession, b: &ChatSession) -> Ordering {
    b.last_activity()
        .cmp(&a.last_activity())
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_sessions(sessions: &mut [ChatSession]) {
    sessions.sort_by(by_activity);
}

/// In-memory directory mirror of the store's sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionDirectory {
    sessions: Arc<Mutex<Vec<ChatSession>>>,
}

impl SessionDirectory {
    pub fn from_sessions(mut sessions: Vec<ChatSession>) -> Self {
        sort_sessions(&mut sessions);
        Self {
            sessions: Arc::new(Mutex::new(sessions)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ChatSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace an entry and re-sort. `publish` receives the changed
    /// entry and the full ordered list while the directory lock is held.
    pub fn upsert<F>(&self, session: ChatSession, publish: F)
    where
        F: FnOnce(&ChatSession, &[ChatSession]),
    {
        let mut sessions = self.lock();
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => sessions.push(session.clone()),
        }
        sort_sessions(&mut sessions);
        publish(&session, &sessions);
    }

    pub fn list(&self) -> Vec<ChatSession> {
        self.lock().clone()
    }

    pub fn get(&self, session_id: &str) -> Option<ChatSession> {
        self.lock().iter().find(|s| s.id == session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().iter().any(|s| s.id == session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Record a changed session and broadcast `sessionUpdated` + `sessionDirectory`
/// to every admin connection.
pub fn publish(state: &AppState, session: ChatSession) {
    state.directory.upsert(session, |changed, sessions| {
        let updated = encode(&ServerEvent::SessionUpdated(changed.clone()));
        let directory = encode(&ServerEvent::SessionDirectory {
            sessions: sessions.to_vec(),
        });
        if let (Some(updated), Some(directory)) = (updated, directory) {
            state.connections.send_to_all_admins(&updated);
            state.connections.send_to_all_admins(&directory);
        }
    });

    tracing::debug!(sessions = state.directory.len(), "Session directory broadcast");
}
