//! SQLite-backed `ChatStore`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{init_db, ChatStore, DbPool, StoreError};
use crate::chat::models::{
    ChatAttachment, ChatMessage, ChatSession, NewMessage, NewSession, Sender, SessionAssignment,
    SessionStatus,
};

const SESSION_COLUMNS: &str = "id, visitor_id, status, assigned_admin_id, customer_email,
     customer_phone, auth_provider, created_at, last_message_at, message_count";

#[derive(Clone)]
pub struct SqliteChatStore {
    db: DbPool,
}

impl SqliteChatStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Open (or create) the database under `data_dir`.
    pub fn open(data_dir: &str) -> Result<Self, StoreError> {
        Ok(Self::new(init_db(data_dir)?))
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut *conn)
        })
        .await?
    }
}

/// Millisecond precision keeps stored and broadcast timestamps identical.
fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ChatSession> {
    let status: String = row.get(2)?;
    let created_at: String = row.get(7)?;
    let last_message_at: Option<String> = row.get(8)?;
    let message_count: i64 = row.get(9)?;

    Ok(ChatSession {
        id: row.get(0)?,
        visitor_id: row.get(1)?,
        status: SessionStatus::from_str(&status).unwrap_or(SessionStatus::Closed),
        assigned_admin_id: row.get(3)?,
        customer_email: row.get(4)?,
        customer_phone: row.get(5)?,
        auth_provider: row.get(6)?,
        created_at: parse_ts(7, &created_at)?,
        last_message_at: last_message_at.as_deref().map(|s| parse_ts(8, s)).transpose()?,
        message_count: message_count.max(0) as u64,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    let sender: String = row.get(2)?;
    let attachments: String = row.get(5)?;
    let created_at: String = row.get(6)?;

    let attachments: Vec<ChatAttachment> = serde_json::from_str(&attachments)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        sender: Sender::from_str(&sender).unwrap_or(Sender::Visitor),
        sender_admin_id: row.get(3)?,
        text: row.get(4)?,
        attachments,
        created_at: parse_ts(6, &created_at)?,
    })
}

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<SessionAssignment> {
    let assigned_at: String = row.get(4)?;
    Ok(SessionAssignment {
        id: row.get(0)?,
        session_id: row.get(1)?,
        previous_admin_id: row.get(2)?,
        assigned_admin_id: row.get(3)?,
        assigned_at: parse_ts(4, &assigned_at)?,
    })
}

fn load_session(conn: &Connection, session_id: &str) -> Result<Option<ChatSession>, StoreError> {
    let session = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE id = ?1"),
            params![session_id],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn create_session(&self, new: NewSession) -> Result<ChatSession, StoreError> {
        self.with_conn(move |conn| {
            let session = ChatSession {
                id: Uuid::now_v7().to_string(),
                visitor_id: new.visitor_id,
                status: SessionStatus::Open,
                assigned_admin_id: None,
                customer_email: new.customer_email,
                customer_phone: new.customer_phone,
                auth_provider: new.auth_provider,
                created_at: now_millis(),
                last_message_at: None,
                message_count: 0,
            };

            conn.execute(
                "INSERT INTO chat_sessions (id, visitor_id, status, customer_email, customer_phone,
                                            auth_provider, created_at, message_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                params![
                    session.id,
                    session.visitor_id,
                    session.status.as_str(),
                    session.customer_email,
                    session.customer_phone,
                    session.auth_provider,
                    format_ts(&session.created_at),
                ],
            )?;

            Ok(session)
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>, StoreError> {
        let sid = session_id.to_string();
        self.with_conn(move |conn| load_session(conn, &sid)).await
    }

    async fn list_sessions(&self) -> Result<Vec<ChatSession>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM chat_sessions"))?;
            let sessions = stmt
                .query_map([], session_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(sessions)
        })
        .await
    }

    async fn assign_session(
        &self,
        session_id: &str,
        admin_id: &str,
    ) -> Result<Option<ChatSession>, StoreError> {
        let sid = session_id.to_string();
        let aid = admin_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let previous: Option<Option<String>> = tx
                .query_row(
                    "SELECT assigned_admin_id FROM chat_sessions WHERE id = ?1",
                    params![sid],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(previous) = previous else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE chat_sessions SET assigned_admin_id = ?1 WHERE id = ?2",
                params![aid, sid],
            )?;
            tx.execute(
                "INSERT INTO chat_assignments (id, session_id, previous_admin_id, assigned_admin_id, assigned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::now_v7().to_string(),
                    sid,
                    previous,
                    aid,
                    format_ts(&now_millis()),
                ],
            )?;

            let session = load_session(&tx, &sid)?;
            tx.commit()?;
            Ok(session)
        })
        .await
    }

    async fn assignment_history(
        &self,
        session_id: &str,
    ) -> Result<Option<Vec<SessionAssignment>>, StoreError> {
        let sid = session_id.to_string();
        self.with_conn(move |conn| {
            if load_session(conn, &sid)?.is_none() {
                return Ok(None);
            }
            let mut stmt = conn.prepare(
                "SELECT id, session_id, previous_admin_id, assigned_admin_id, assigned_at
                 FROM chat_assignments
                 WHERE session_id = ?1
                 ORDER BY rowid",
            )?;
            let history = stmt
                .query_map(params![sid], assignment_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(Some(history))
        })
        .await
    }

    async fn close_session(&self, session_id: &str) -> Result<Option<ChatSession>, StoreError> {
        let sid = session_id.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE chat_sessions SET status = ?1 WHERE id = ?2",
                params![SessionStatus::Closed.as_str(), sid],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            load_session(conn, &sid)
        })
        .await
    }

    async fn append_message(
        &self,
        message: NewMessage,
    ) -> Result<(ChatMessage, ChatSession), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let stored = ChatMessage {
                id: Uuid::now_v7().to_string(),
                session_id: message.session_id,
                sender: message.sender,
                sender_admin_id: message.sender_admin_id,
                text: message.text,
                attachments: message.attachments,
                created_at: now_millis(),
            };
            let created_at = format_ts(&stored.created_at);

            let updated = tx.execute(
                "UPDATE chat_sessions
                 SET last_message_at = ?1, message_count = message_count + 1
                 WHERE id = ?2",
                params![created_at, stored.session_id],
            )?;
            if updated == 0 {
                return Err(StoreError::UnknownSession(stored.session_id));
            }

            tx.execute(
                "INSERT INTO chat_messages (id, session_id, sender, sender_admin_id, text, attachments, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    stored.id,
                    stored.session_id,
                    stored.sender.as_str(),
                    stored.sender_admin_id,
                    stored.text,
                    serde_json::to_string(&stored.attachments)?,
                    created_at,
                ],
            )?;

            let session = load_session(&tx, &stored.session_id)?
                .ok_or_else(|| StoreError::UnknownSession(stored.session_id.clone()))?;
            tx.commit()?;

            Ok((stored, session))
        })
        .await
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<(Vec<ChatMessage>, bool), StoreError> {
        let sid = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, sender, sender_admin_id, text, attachments, created_at
                 FROM chat_messages
                 WHERE session_id = ?1
                 ORDER BY seq DESC
                 LIMIT ?2",
            )?;
            let mut messages = stmt
                .query_map(params![sid, limit as i64 + 1], message_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let has_more = messages.len() > limit as usize;
            messages.truncate(limit as usize);
            messages.reverse();

            Ok((messages, has_more))
        })
        .await
    }
}
