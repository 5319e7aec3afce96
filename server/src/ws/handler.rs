use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::chat::models::AdminIdentity;
use crate::state::AppState;
use crate::ws::actor::{self, Participant};

/// Query parameters for WebSocket connection.
/// Admins: ?role=admin&adminId=..&adminName=..&adminAvatar=..&adminColor=..
/// Visitors: ?role=visitor&sessionId=..&visitorId=..
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsConnectQuery {
    pub role: Option<String>,
    pub admin_id: Option<String>,
    pub admin_name: Option<String>,
    pub admin_avatar: Option<String>,
    pub admin_color: Option<String>,
    pub session_id: Option<String>,
    pub visitor_id: Option<String>,
}

/// WebSocket close codes:
/// 4002 = handshake invalid (unknown role, missing identity)
/// 4004 = visitor session unknown or not owned by the visitor
const CLOSE_HANDSHAKE_INVALID: u16 = 4002;
const CLOSE_SESSION_UNKNOWN: u16 = 4004;

/// Tint used when an admin connects without declaring one.
const DEFAULT_ADMIN_COLOR: &str = "#64748b";

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl WsConnectQuery {
    /// Resolve the handshake into a participant, without touching the store.
    /// Name and color fall back to defaults; the admin id is mandatory.
    pub fn participant(self) -> Result<Participant, &'static str> {
        match self.role.as_deref() {
            Some("admin") => {
                let id = non_empty(self.admin_id).ok_or("Missing adminId")?;
                Ok(Participant::Admin(AdminIdentity {
                    name: non_empty(self.admin_name).unwrap_or_else(|| id.clone()),
                    avatar: non_empty(self.admin_avatar),
                    color: non_empty(self.admin_color)
                        .unwrap_or_else(|| DEFAULT_ADMIN_COLOR.to_string()),
                    id,
                }))
            }
            Some("visitor") => Ok(Participant::Visitor {
                session_id: non_empty(self.session_id).ok_or("Missing sessionId")?,
                visitor_id: non_empty(self.visitor_id).ok_or("Missing visitorId")?,
            }),
            _ => Err("Unknown role"),
        }
    }
}

/// Upgrade, then immediately close with the given code.
fn reject(ws: WebSocketUpgrade, code: u16, reason: &'static str) -> Response {
    tracing::warn!(close_code = code, reason = reason, "WebSocket handshake rejected");

    ws.on_upgrade(move |mut socket| async move {
        let close_frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = socket.send(Message::Close(Some(close_frame))).await;
    })
}

/// GET /ws?role=..
/// WebSocket upgrade endpoint. The identity is declared in the query string.
/// On a bad handshake, upgrades then immediately closes with a close code.
/// On success, spawns an actor for the connection.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let participant = match params.participant() {
        Ok(participant) => participant,
        Err(reason) => return reject(ws, CLOSE_HANDSHAKE_INVALID, reason),
    };

    if let Participant::Visitor {
        session_id,
        visitor_id,
    } = &participant
    {
        match state.store.get_session(session_id).await {
            Ok(Some(session)) if session.visitor_id == *visitor_id => {}
            Ok(_) => return reject(ws, CLOSE_SESSION_UNKNOWN, "Unknown session"),
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %e,
                    "Failed to look up visitor session"
                );
                return reject(ws, CLOSE_SESSION_UNKNOWN, "Unknown session");
            }
        }
    }

    ws.on_upgrade(move |socket| actor::run_connection(socket, state, participant))
}
