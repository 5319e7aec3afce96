//! Wire and domain types shared by the chat components.
//!
//! Everything here serializes camelCase because the admin panel and the
//! visitor widget consume these payloads directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity an admin socket declares at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminIdentity {
    /// Stable per admin, shared by all of their tabs and devices.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub color: String,
}

/// Open sessions accept messages, closed ones are read-only history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub visitor_id: String,
    pub status: SessionStatus,
    /// Advisory owner. Any joined admin may still send.
    pub assigned_admin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_provider: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u64,
}

impl ChatSession {
    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    /// Timestamp the directory sorts by.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Visitor,
    Admin,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visitor => "visitor",
            Self::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "visitor" => Some(Self::Visitor),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// Descriptor of an already-uploaded file. The chat core never uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAttachment {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub mime: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_admin_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<ChatAttachment>,
    pub created_at: DateTime<Utc>,
}

/// One entry of a session's assignment audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAssignment {
    pub id: String,
    pub session_id: String,
    #[serde(default)]
    pub previous_admin_id: Option<String>,
    pub assigned_admin_id: String,
    pub assigned_at: DateTime<Utc>,
}

/// Input for creating a session through the visitor flow.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub visitor_id: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub auth_provider: Option<String>,
}

/// A validated message waiting to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub sender: Sender,
    pub sender_admin_id: Option<String>,
    pub text: String,
    pub attachments: Vec<ChatAttachment>,
}
