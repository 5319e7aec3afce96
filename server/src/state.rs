use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::chat::directory::SessionDirectory;
use crate::chat::roster::SessionRosters;
use crate::chat::typing::TypingTracker;
use crate::db::{ChatStore, StoreError};
use crate::ws::ConnectionRegistry;

/// Content limits applied to every outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatLimits {
    /// Maximum text length in chars.
    pub max_message_length: usize,
    pub max_attachments: usize,
}

impl Default for ChatLimits {
    fn default() -> Self {
        Self {
            max_message_length: 4000,
            max_attachments: 10,
        }
    }
}

/// WebSocket keepalive: ping period and how long to wait for the pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

/// One async lock per session, held across store I/O so that operations on a
/// session are serialized without blocking other sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub async fn acquire(&self, session_id: &str) -> SessionGuard {
        // Clone the Arc out so the map shard is not held across the await.
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_default()
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        SessionGuard {
            guard: Some(guard),
            session_id: session_id.to_string(),
            locks: self.locks.clone(),
        }
    }

    /// Sessions with a lock held or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held session lock. On release the map entry is dropped unless another
/// task holds or waits on it.
#[derive(Debug)]
pub struct SessionGuard {
    guard: Option<OwnedMutexGuard<()>>,
    session_id: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Waiters clone the Arc under the shard lock, so the count is exact here.
        self.locks
            .remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Persistence collaborator for sessions and messages
    pub store: Arc<dyn ChatStore>,
    /// Live admin and visitor sockets, presence reference counts
    pub connections: ConnectionRegistry,
    /// Which admin connections are joined to which sessions
    pub rosters: SessionRosters,
    /// Ephemeral typing state with expiry
    pub typing: TypingTracker,
    /// Ordered session summaries pushed to admin sidebars
    pub directory: SessionDirectory,
    /// Per-session serialization of sends and assignments
    pub session_locks: SessionLocks,
    pub limits: ChatLimits,
    pub heartbeat: Heartbeat,
}

impl AppState {
    /// Build the state, seeding the directory from the store.
    pub async fn load(
        store: Arc<dyn ChatStore>,
        limits: ChatLimits,
        typing_ttl: Duration,
    ) -> Result<Self, StoreError> {
        let sessions = store.list_sessions().await?;
        tracing::info!(sessions = sessions.len(), "Session directory loaded");

        Ok(Self {
            store,
            connections: ConnectionRegistry::new(),
            rosters: SessionRosters::new(),
            typing: TypingTracker::new(typing_ttl),
            directory: SessionDirectory::from_sessions(sessions),
            session_locks: SessionLocks::default(),
            limits,
            heartbeat: Heartbeat::default(),
        })
    }

    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_locks_are_pruned_on_release() {
        let locks = SessionLocks::default();

        let first = locks.acquire("s1").await;
        let other = locks.acquire("s2").await;
        assert_eq!(locks.len(), 2);

        // A waiter keeps the entry alive past the first release.
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("s1").await;
            })
        };
        tokio::task::yield_now().await;
        drop(first);
        waiter.await.unwrap();

        drop(other);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn session_lock_serializes_holders() {
        let locks = SessionLocks::default();
        let guard = locks.acquire("s1").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("s1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        let second = contender.await.unwrap();
        assert_eq!(locks.len(), 1);
        drop(second);
        assert!(locks.is_empty());
    }
}
