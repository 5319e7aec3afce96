use axum::Router;

use crate::chat::{messages, presence, sessions};
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the full axum Router with all routes.
pub fn build_router(state: AppState) -> Router {
    // WebSocket endpoint (role and identity via query params)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    // Health check
    let health = Router::new().route("/health", axum::routing::get(health_check));

    let session_routes = Router::new()
        .route(
            "/chat/sessions",
            axum::routing::get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/chat/sessions/{session_id}",
            axum::routing::get(sessions::get_session),
        )
        .route(
            "/chat/sessions/{session_id}/messages",
            axum::routing::get(messages::get_session_messages),
        )
        .route(
            "/chat/sessions/{session_id}/assign",
            axum::routing::post(sessions::assign_session),
        )
        .route(
            "/chat/sessions/{session_id}/assignments",
            axum::routing::get(sessions::get_assignments),
        )
        .route(
            "/chat/sessions/{session_id}/close",
            axum::routing::post(sessions::close_session),
        );

    let presence_routes =
        Router::new().route("/chat/presence", axum::routing::get(presence::get_presence));

    Router::new()
        .merge(session_routes)
        .merge(presence_routes)
        .merge(ws_routes)
        .merge(health)
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
