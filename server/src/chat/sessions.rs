//! REST endpoints for the session lifecycle: create, list, assign, close.
//! Assignments also leave an audit trail that can be read back.
//!
//! Every mutation goes through the store first and then through the
//! directory, so admins see the change on their sockets as well.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::chat::directory;
use crate::chat::error::ChatError;
use crate::chat::models::{ChatSession, NewSession, SessionAssignment};
use crate::state::AppState;

// --- Request types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignSessionRequest {
    pub admin_id: String,
}

// --- Handlers ---

/// POST /chat/sessions — open a session for a visitor.
pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<NewSession>,
) -> Result<(StatusCode, Json<ChatSession>), StatusCode> {
    if body.visitor_id.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let session = state
        .store
        .create_session(body)
        .await
        .map_err(ChatError::from)?;

    tracing::info!(
        session_id = %session.id,
        visitor_id = %session.visitor_id,
        "Chat session created"
    );

    directory::publish(&state, session.clone());

    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /chat/sessions — the directory, most recently active first.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<ChatSession>> {
    Json(state.directory.list())
}

/// GET /chat/sessions/{session_id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ChatSession>, StatusCode> {
    state
        .store
        .get_session(&session_id)
        .await
        .map_err(ChatError::from)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// `assign`: mark an admin as owner of a session. Last assignment wins.
pub async fn assign(
    state: &AppState,
    session_id: &str,
    admin_id: &str,
) -> Result<ChatSession, ChatError> {
    let _guard = state.session_locks.acquire(session_id).await;

    let session = state
        .store
        .assign_session(session_id, admin_id)
        .await?
        .ok_or(ChatError::SessionNotFound)?;

    tracing::info!(
        session_id = %session_id,
        admin_id = %admin_id,
        "Chat session assigned"
    );

    directory::publish(state, session.clone());
    Ok(session)
}

/// Close a session; further sends are rejected.
pub async fn close(state: &AppState, session_id: &str) -> Result<ChatSession, ChatError> {
    let _guard = state.session_locks.acquire(session_id).await;

    let session = state
        .store
        .close_session(session_id)
        .await?
        .ok_or(ChatError::SessionNotFound)?;

    tracing::info!(session_id = %session_id, "Chat session closed");

    directory::publish(state, session.clone());
    Ok(session)
}

/// POST /chat/sessions/{session_id}/assign — Body: { "adminId": "..." }
pub async fn assign_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<AssignSessionRequest>,
) -> Result<Json<ChatSession>, StatusCode> {
    let admin_id = body.admin_id.trim();
    if admin_id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    Ok(Json(assign(&state, &session_id, admin_id).await?))
}

/// GET /chat/sessions/{session_id}/assignments — audit trail, oldest first.
pub async fn get_assignments(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<SessionAssignment>>, StatusCode> {
    state
        .store
        .assignment_history(&session_id)
        .await
        .map_err(ChatError::from)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// POST /chat/sessions/{session_id}/close
pub async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ChatSession>, StatusCode> {
    Ok(Json(close(&state, &session_id).await?))
}
