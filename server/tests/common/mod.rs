//! Shared helpers for the integration tests: a server on a random port,
//! WebSocket clients that speak the JSON event protocol, REST shortcuts.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use concierge_server::chat::typing::spawn_typing_sweep;
use concierge_server::db::{ChatStore, SqliteChatStore};
use concierge_server::state::{AppState, ChatLimits, Heartbeat};

/// Short enough that expiry tests finish quickly.
pub const TEST_TYPING_TTL: Duration = Duration::from_millis(300);
pub const TEST_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for an expected event.
const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Knobs a test may turn; everything else uses production defaults.
#[derive(Debug, Clone, Copy)]
pub struct TestOptions {
    pub typing_ttl: Duration,
    pub heartbeat: Heartbeat,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            typing_ttl: TEST_TYPING_TTL,
            heartbeat: Heartbeat::default(),
        }
    }
}

pub struct TestServer {
    pub base_url: String,
    pub addr: SocketAddr,
    pub state: AppState,
}

/// Helper: start the server on a random port backed by a fresh SQLite store.
pub async fn start_test_server() -> TestServer {
    start_test_server_with(TestOptions::default()).await
}

/// Helper: like `start_test_server`, with custom timings.
pub async fn start_test_server_with(options: TestOptions) -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();
    let store = SqliteChatStore::open(&data_dir).expect("Failed to open store");

    let server = start_server(Arc::new(store), options).await;
    // Keep the directory alive as long as the test process runs.
    std::mem::forget(tmp_dir);
    server
}

/// Helper: start the server on a random port with the given store.
pub async fn start_test_server_with_store(store: Arc<dyn ChatStore>) -> TestServer {
    start_server(store, TestOptions::default()).await
}

async fn start_server(store: Arc<dyn ChatStore>, options: TestOptions) -> TestServer {
    let state = AppState::load(store, ChatLimits::default(), options.typing_ttl)
        .await
        .expect("Failed to load state")
        .with_heartbeat(options.heartbeat);
    spawn_typing_sweep(state.clone(), TEST_SWEEP_INTERVAL);

    let app = concierge_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        base_url: format!("http://{}", addr),
        addr,
        state,
    }
}

/// POST /chat/sessions and return the created session.
pub async fn create_session(base_url: &str, visitor_id: &str) -> Value {
    let resp = reqwest::Client::new()
        .post(format!("{}/chat/sessions", base_url))
        .json(&json!({ "visitorId": visitor_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201, "Session creation failed");
    resp.json().await.unwrap()
}

pub struct WsClient {
    pub ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Events read by `expect_no_event` that it was not looking for.
    pending: VecDeque<(String, Value)>,
}

impl WsClient {
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("Failed to connect to WebSocket");
        Self {
            ws,
            pending: VecDeque::new(),
        }
    }

    /// Connect as an admin and consume the presence snapshot and directory
    /// that every new admin connection receives.
    pub async fn admin(addr: SocketAddr, id: &str, name: &str) -> Self {
        let mut client = Self::connect(&format!(
            "ws://{}/ws?role=admin&adminId={}&adminName={}&adminColor=%232563eb",
            addr, id, name
        ))
        .await;
        client.next_event("adminPresence").await;
        client.next_event("sessionDirectory").await;
        client
    }

    pub async fn visitor(addr: SocketAddr, session_id: &str, visitor_id: &str) -> Self {
        Self::connect(&format!(
            "ws://{}/ws?role=visitor&sessionId={}&visitorId={}",
            addr, session_id, visitor_id
        ))
        .await
    }

    pub async fn send(&mut self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        self.ws
            .send(Message::Text(frame.into()))
            .await
            .expect("Failed to send frame");
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("Failed to send raw frame");
    }

    pub async fn join(&mut self, session_id: &str) {
        self.send("joinSession", json!({ "sessionId": session_id }))
            .await;
    }

    pub async fn send_text(&mut self, session_id: &str, text: &str) {
        self.send(
            "message",
            json!({ "sessionId": session_id, "sender": "admin", "text": text }),
        )
        .await;
    }

    /// Next decoded `{event, data}` frame, or None on timeout/close.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<(String, Value)> {
        loop {
            let msg = tokio::time::timeout(wait, self.ws.next()).await.ok()??;
            match msg.ok()? {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    let event = value["event"].as_str().unwrap().to_string();
                    return Some((event, value["data"].clone()));
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Wait for the next event with this name and a payload matching `pred`,
    /// skipping anything else.
    pub async fn next_matching<F>(&mut self, event: &str, pred: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        while let Some((name, data)) = self.pending.pop_front() {
            if name == event && pred(&data) {
                return data;
            }
        }

        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.recv_within(remaining).await {
                Some((name, data)) if name == event && pred(&data) => return data,
                Some(_) => continue,
                None => panic!("Timed out waiting for {} event", event),
            }
        }
    }

    pub async fn next_event(&mut self, event: &str) -> Value {
        self.next_matching(event, |_| true).await
    }

    /// Assert no event with this name arrives within `wait`. Other events
    /// stay queued for the next `next_matching`.
    pub async fn expect_no_event(&mut self, event: &str, wait: Duration) {
        if let Some((_, data)) = self.pending.iter().find(|(name, _)| name == event) {
            panic!("Unexpected {} event: {}", event, data);
        }

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return;
            }
            match self.recv_within(remaining).await {
                Some((name, data)) if name == event => {
                    panic!("Unexpected {} event: {}", event, data)
                }
                Some(other) => self.pending.push_back(other),
                None => return,
            }
        }
    }

    /// Discard whatever arrives within `wait`.
    pub async fn drain(&mut self, wait: Duration) {
        self.pending.clear();
        while self.recv_within(wait).await.is_some() {}
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        // Read until the server acknowledges so its cleanup has run.
        while let Ok(Some(Ok(msg))) =
            tokio::time::timeout(Duration::from_secs(1), self.ws.next()).await
        {
            if msg.is_close() {
                break;
            }
        }
    }
}

/// Admin ids listed in an `adminPresence` or `sessionAdmins` payload.
pub fn admin_ids(data: &Value) -> Vec<String> {
    data["admins"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["id"].as_str().unwrap().to_string())
        .collect()
}

/// Session ids of a `sessionDirectory` payload, in order.
pub fn directory_ids(data: &Value) -> Vec<String> {
    data["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap().to_string())
        .collect()
}
