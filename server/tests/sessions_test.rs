//! Integration tests for the REST session surface and store-failure handling.

mod common;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use concierge_server::chat::models::{
    ChatMessage, ChatSession, NewMessage, NewSession, SessionAssignment, SessionStatus,
};
use concierge_server::db::{ChatStore, StoreError};

use common::{
    admin_ids, create_session, directory_ids, start_test_server, start_test_server_with_store,
    WsClient,
};

#[tokio::test]
async fn test_create_list_and_get_sessions() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();

    let first = create_session(&server.base_url, "guest-1").await;
    assert_eq!(first["visitorId"], "guest-1");
    assert_eq!(first["status"], "open");
    assert_eq!(first["messageCount"], 0);
    assert!(first["assignedAdminId"].is_null());

    tokio::time::sleep(Duration::from_millis(5)).await;

    let resp = client
        .post(format!("{}/chat/sessions", server.base_url))
        .json(&json!({
            "visitorId": "guest-2",
            "customerEmail": "guest2@example.com",
            "authProvider": "google"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let second: Value = resp.json().await.unwrap();
    assert_eq!(second["customerEmail"], "guest2@example.com");

    let listed: Value = client
        .get(format!("{}/chat/sessions", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap())
        .collect();
    assert_eq!(
        ids,
        vec![second["id"].as_str().unwrap(), first["id"].as_str().unwrap()]
    );

    let fetched: Value = client
        .get(format!("{}/chat/sessions/{}", server.base_url, first["id"].as_str().unwrap()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched, first);

    let resp = client
        .get(format!("{}/chat/sessions/missing", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{}/chat/sessions", server.base_url))
        .json(&json!({ "visitorId": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_new_session_is_pushed_to_admins() {
    let server = start_test_server().await;
    let mut ana = WsClient::admin(server.addr, "ana", "Ana").await;

    let session = create_session(&server.base_url, "guest-1").await;

    let updated = ana.next_event("sessionUpdated").await;
    assert_eq!(updated, session);
    let directory = ana.next_event("sessionDirectory").await;
    assert_eq!(
        directory_ids(&directory),
        vec![session["id"].as_str().unwrap().to_string()]
    );
}

#[tokio::test]
async fn test_assign_is_last_write_wins_and_broadcast() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let session = create_session(&server.base_url, "guest-1").await;
    let sid = session["id"].as_str().unwrap();

    let mut ben = WsClient::admin(server.addr, "ben", "Ben").await;

    for admin_id in ["ana", "ben"] {
        let resp = client
            .post(format!("{}/chat/sessions/{}/assign", server.base_url, sid))
            .json(&json!({ "adminId": admin_id }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let assigned: Value = resp.json().await.unwrap();
        assert_eq!(assigned["assignedAdminId"], admin_id);

        let updated = ben.next_event("sessionUpdated").await;
        assert_eq!(updated["assignedAdminId"], admin_id);
        let directory = ben.next_event("sessionDirectory").await;
        assert_eq!(directory["sessions"][0]["assignedAdminId"], admin_id);
    }

    assert_eq!(
        server.state.directory.get(sid).unwrap().assigned_admin_id.as_deref(),
        Some("ben")
    );

    // Both assignments are kept in the audit trail, oldest first.
    let trail: Value = client
        .get(format!("{}/chat/sessions/{}/assignments", server.base_url, sid))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let trail = trail.as_array().unwrap();
    assert_eq!(trail.len(), 2);
    assert!(trail[0]["previousAdminId"].is_null());
    assert_eq!(trail[0]["assignedAdminId"], "ana");
    assert_eq!(trail[1]["previousAdminId"], "ana");
    assert_eq!(trail[1]["assignedAdminId"], "ben");

    let resp = client
        .get(format!("{}/chat/sessions/missing/assignments", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{}/chat/sessions/missing/assign", server.base_url))
        .json(&json!({ "adminId": "ana" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{}/chat/sessions/{}/assign", server.base_url, sid))
        .json(&json!({ "adminId": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_closed_session_rejects_messages() {
    let server = start_test_server().await;
    let session = create_session(&server.base_url, "guest-1").await;
    let sid = session["id"].as_str().unwrap();

    let mut ana = WsClient::admin(server.addr, "ana", "Ana").await;
    ana.join(sid).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/chat/sessions/{}/close", server.base_url, sid))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let closed: Value = resp.json().await.unwrap();
    assert_eq!(closed["status"], "closed");

    let updated = ana.next_event("sessionUpdated").await;
    assert_eq!(updated["status"], "closed");

    ana.send_text(sid, "hello?").await;
    assert_eq!(
        ana.next_event("chatError").await["message"],
        "Session is closed"
    );
    ana.expect_no_event("message", Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_message_history_returns_most_recent_page() {
    let server = start_test_server().await;
    let session = create_session(&server.base_url, "guest-1").await;
    let sid = session["id"].as_str().unwrap();

    let mut ana = WsClient::admin(server.addr, "ana", "Ana").await;
    ana.join(sid).await;
    for text in ["one", "two", "three"] {
        ana.send_text(sid, text).await;
        ana.next_matching("message", |m| m["text"] == text).await;
    }

    let page: Value = reqwest::get(format!(
        "{}/chat/sessions/{}/messages?limit=2",
        server.base_url, sid
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    let texts: Vec<&str> = page["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["two", "three"]);
    assert_eq!(page["hasMore"], true);

    let resp = reqwest::get(format!("{}/chat/sessions/missing/messages", server.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_presence_and_health_endpoints() {
    let server = start_test_server().await;
    let _ana = WsClient::admin(server.addr, "ana", "Ana").await;
    let _ana_tab = WsClient::admin(server.addr, "ana", "Ana").await;
    let _ben = WsClient::admin(server.addr, "ben", "Ben").await;

    let online: Value = reqwest::get(format!("{}/chat/presence", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(admin_ids(&json!({ "admins": online })), vec!["ana", "ben"]);
    assert_eq!(online[0]["color"], "#2563eb");

    let health = reqwest::get(format!("{}/health", server.base_url))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(health, "ok");
}

/// Store whose writes always fail; reads see one open session.
struct FailingStore {
    session: ChatSession,
}

impl FailingStore {
    fn new() -> Self {
        Self {
            session: ChatSession {
                id: "broken".to_string(),
                visitor_id: "guest-1".to_string(),
                status: SessionStatus::Open,
                assigned_admin_id: None,
                customer_email: None,
                customer_phone: None,
                auth_provider: None,
                created_at: Utc::now(),
                last_message_at: None,
                message_count: 0,
            },
        }
    }
}

#[async_trait]
impl ChatStore for FailingStore {
    async fn create_session(&self, _new: NewSession) -> Result<ChatSession, StoreError> {
        Err(StoreError::LockPoisoned)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>, StoreError> {
        Ok((session_id == self.session.id).then(|| self.session.clone()))
    }

    async fn list_sessions(&self) -> Result<Vec<ChatSession>, StoreError> {
        Ok(vec![self.session.clone()])
    }

    async fn assign_session(
        &self,
        _session_id: &str,
        _admin_id: &str,
    ) -> Result<Option<ChatSession>, StoreError> {
        Err(StoreError::LockPoisoned)
    }

    async fn assignment_history(
        &self,
        _session_id: &str,
    ) -> Result<Option<Vec<SessionAssignment>>, StoreError> {
        Err(StoreError::LockPoisoned)
    }

    async fn close_session(&self, _session_id: &str) -> Result<Option<ChatSession>, StoreError> {
        Err(StoreError::LockPoisoned)
    }

    async fn append_message(
        &self,
        _message: NewMessage,
    ) -> Result<(ChatMessage, ChatSession), StoreError> {
        Err(StoreError::LockPoisoned)
    }

    async fn recent_messages(
        &self,
        _session_id: &str,
        _limit: u32,
    ) -> Result<(Vec<ChatMessage>, bool), StoreError> {
        Err(StoreError::LockPoisoned)
    }
}

#[tokio::test]
async fn test_store_failure_surfaces_generic_chat_error() {
    let server = start_test_server_with_store(Arc::new(FailingStore::new())).await;

    let mut ana = WsClient::admin(server.addr, "ana", "Ana").await;
    let mut ben = WsClient::admin(server.addr, "ben", "Ben").await;
    ana.join("broken").await;
    ben.join("broken").await;
    ana.next_matching("sessionAdmins", |d| admin_ids(d).len() == 2)
        .await;

    ana.send_text("broken", "hello").await;
    assert_eq!(
        ana.next_event("chatError").await["message"],
        "Failed to process chat request"
    );
    ben.expect_no_event("chatError", Duration::from_millis(300))
        .await;

    // Nothing fatal: the connection keeps working.
    ana.send("leaveSession", json!({ "sessionId": "broken" }))
        .await;
    assert_eq!(
        admin_ids(&ben.next_event("sessionAdmins").await),
        vec!["ben"]
    );

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/chat/sessions/broken/assign", server.base_url))
        .json(&json!({ "adminId": "ana" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);

    let resp = client
        .get(format!("{}/chat/sessions/broken/messages", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
}
