pub mod migrations;
pub mod store;

use async_trait::async_trait;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::chat::models::{ChatMessage, ChatSession, NewMessage, NewSession, SessionAssignment};

pub use store::SqliteChatStore;

/// Type alias for the shared database connection.
/// rusqlite is synchronous — we wrap in Arc<Mutex> for thread safety
/// with tokio::task::spawn_blocking for DB operations.
pub type DbPool = Arc<Mutex<Connection>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("attachment encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("session {0} does not exist")]
    UnknownSession(String),
}

/// Persistence collaborator for sessions and messages.
///
/// The coordination core only talks to this trait; storage layout is the
/// implementor's business.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_session(&self, new: NewSession) -> Result<ChatSession, StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>, StoreError>;

    async fn list_sessions(&self) -> Result<Vec<ChatSession>, StoreError>;

    /// Last-assign-wins. Returns `None` for an unknown session.
    async fn assign_session(
        &self,
        session_id: &str,
        admin_id: &str,
    ) -> Result<Option<ChatSession>, StoreError>;

    /// Every assignment of a session, oldest first. `None` for an unknown session.
    async fn assignment_history(
        &self,
        session_id: &str,
    ) -> Result<Option<Vec<SessionAssignment>>, StoreError>;

    async fn close_session(&self, session_id: &str) -> Result<Option<ChatSession>, StoreError>;

    /// Persist a message and bump the session's activity counters atomically.
    /// Returns the stored message (id and timestamp assigned) and the updated session.
    async fn append_message(
        &self,
        message: NewMessage,
    ) -> Result<(ChatMessage, ChatSession), StoreError>;

    /// Most recent `limit` messages in creation order, plus whether older ones exist.
    async fn recent_messages(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<(Vec<ChatMessage>, bool), StoreError>;
}

/// Initialize the SQLite database: create data directory if needed,
/// open (or create) the database file, enable WAL mode, and run migrations.
pub fn init_db(data_dir: &str) -> Result<DbPool, StoreError> {
    std::fs::create_dir_all(data_dir)?;

    let db_path = Path::new(data_dir).join("concierge.db");
    let mut conn = Connection::open(&db_path)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    migrations::migrations().to_latest(&mut conn)?;

    tracing::info!("Database initialized at {}", db_path.display());

    Ok(Arc::new(Mutex::new(conn)))
}
