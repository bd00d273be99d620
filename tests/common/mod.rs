//! Shared test fixtures: an in-process stand-in for the InfluxDB v2 API.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use dbplugin::dbplugin::{ConfigMap, ConfigValue};

pub const MOCK_TOKEN: &str = "mock-influx-token";
pub const MOCK_ORG: &str = "vault";
pub const MOCK_ORG_ID: &str = "org1";

#[derive(Default)]
pub struct MockState {
    calls: Mutex<Vec<String>>,
    users: Mutex<HashMap<String, String>>,
    next_id: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    pub fail_add_member: AtomicBool,
    pub create_delay_ms: AtomicU64,
    bad_auth: AtomicUsize,
}

impl MockState {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn enter(&self, headers: &HeaderMap) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let expected = format!("Token {MOCK_TOKEN}");
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
            self.bad_auth.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockInflux {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockInflux {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/health", get(health))
            .route("/api/v2/users", post(create_user).get(find_users))
            .route("/api/v2/users/:id", delete(delete_user))
            .route("/api/v2/users/:id/password", post(set_password))
            .route("/api/v2/orgs", get(find_orgs))
            .route("/api/v2/orgs/:id/members", post(add_member))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, app).into_future());
        Self { addr, state }
    }

    /// Adapter config pointing at this server.
    pub fn config(&self) -> ConfigMap {
        let mut config = ConfigMap::new();
        config.insert("host".to_string(), "127.0.0.1".into());
        config.insert(
            "port".to_string(),
            ConfigValue::Int(i64::from(self.addr.port())),
        );
        config.insert("token".to_string(), MOCK_TOKEN.into());
        config.insert("organization".to_string(), MOCK_ORG.into());
        config
    }

    /// Every request except health checks, as `METHOD path`.
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn user_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.users.lock().unwrap().values().cloned().collect();
        names.sort();
        names
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn bad_auth_count(&self) -> usize {
        self.state.bad_auth.load(Ordering::SeqCst)
    }

    pub fn fail_add_member(&self, fail: bool) {
        self.state.fail_add_member.store(fail, Ordering::SeqCst);
    }

    pub fn delay_create(&self, delay: Duration) {
        self.state
            .create_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "name": "influxdb", "status": "pass" }))
}

async fn create_user(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.enter(&headers);
    state.record("POST /api/v2/users".to_string());
    let delay = state.create_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    let name = body["name"].as_str().unwrap_or_default().to_string();
    let id = format!("u{}", state.next_id.fetch_add(1, Ordering::SeqCst) + 1);
    state.users.lock().unwrap().insert(id.clone(), name.clone());
    state.leave();
    (
        StatusCode::CREATED,
        Json(json!({ "id": id, "name": name, "status": "active" })),
    )
        .into_response()
}

async fn find_users(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.enter(&headers);
    let name = query.get("name").cloned().unwrap_or_default();
    state.record(format!("GET /api/v2/users?name={name}"));
    let users: Vec<Value> = state
        .users
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, n)| **n == name)
        .map(|(id, n)| json!({ "id": id, "name": n }))
        .collect();
    state.leave();
    if users.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "code": "not found", "message": "user not found" })),
        )
            .into_response();
    }
    Json(json!({ "users": users })).into_response()
}

async fn delete_user(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    state.enter(&headers);
    state.record(format!("DELETE /api/v2/users/{id}"));
    let removed = state.users.lock().unwrap().remove(&id);
    state.leave();
    match removed {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "code": "not found", "message": "user not found" })),
        )
            .into_response(),
    }
}

async fn set_password(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    state.enter(&headers);
    state.record(format!("POST /api/v2/users/{id}/password"));
    state.leave();
    StatusCode::NO_CONTENT.into_response()
}

async fn find_orgs(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.enter(&headers);
    let org = query.get("org").cloned().unwrap_or_default();
    state.record(format!("GET /api/v2/orgs?org={org}"));
    state.leave();
    let orgs = if org == MOCK_ORG {
        vec![json!({ "id": MOCK_ORG_ID, "name": MOCK_ORG })]
    } else {
        Vec::new()
    };
    Json(json!({ "orgs": orgs })).into_response()
}

async fn add_member(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(org_id): Path<String>,
) -> Response {
    state.enter(&headers);
    state.record(format!("POST /api/v2/orgs/{org_id}/members"));
    state.leave();
    if state.fail_add_member.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "code": "internal error", "message": "member add failed" })),
        )
            .into_response();
    }
    StatusCode::CREATED.into_response()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
