use axum::http::StatusCode;
use thiserror::Error;

use crate::db::StoreError;

/// Send-time failures surfaced to the originating connection as `chatError`.
///
/// The `Display` text is what the client sees, so store faults stay generic
/// and keep their cause only as the error source.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Message must contain text or at least one attachment")]
    EmptyMessage,

    #[error("Message exceeds {max} characters")]
    MessageTooLong { max: usize },

    #[error("At most {max} attachments per message")]
    TooManyAttachments { max: usize },

    #[error("Attachment {0} has no url")]
    InvalidAttachment(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Not permitted for this connection")]
    NotPermitted,

    #[error("Failed to process chat request")]
    Store(#[source] StoreError),
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl ChatError {
    /// Status for the REST surface. Store faults are logged here since the
    /// response body never carries them.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EmptyMessage | Self::InvalidAttachment(_) => StatusCode::BAD_REQUEST,
            Self::MessageTooLong { .. } | Self::TooManyAttachments { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::SessionClosed => StatusCode::CONFLICT,
            Self::NotPermitted => StatusCode::FORBIDDEN,
            Self::Store(source) => {
                tracing::error!(error = %source, "Chat store request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<ChatError> for StatusCode {
    fn from(err: ChatError) -> Self {
        err.status_code()
    }
}
