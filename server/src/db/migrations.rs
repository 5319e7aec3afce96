use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking — no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: Chat sessions and messages

CREATE TABLE chat_sessions (
    id TEXT PRIMARY KEY,
    visitor_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    assigned_admin_id TEXT,
    customer_email TEXT,
    customer_phone TEXT,
    auth_provider TEXT,
    created_at TEXT NOT NULL,
    last_message_at TEXT,
    message_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX idx_chat_sessions_visitor ON chat_sessions(visitor_id);

CREATE TABLE chat_messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    session_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    sender_admin_id TEXT,
    text TEXT NOT NULL,
    attachments TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    FOREIGN KEY (session_id) REFERENCES chat_sessions(id)
);

CREATE INDEX idx_chat_messages_session ON chat_messages(session_id, seq);
",
        ),
        M::up(
            "-- Migration 2: Assignment audit trail

CREATE TABLE chat_assignments (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    previous_admin_id TEXT,
    assigned_admin_id TEXT NOT NULL,
    assigned_at TEXT NOT NULL,
    FOREIGN KEY (session_id) REFERENCES chat_sessions(id)
);

CREATE INDEX idx_chat_assignments_session ON chat_assignments(session_id);
",
        ),
    ])
}
