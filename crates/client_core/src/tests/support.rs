use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use storage::{KeyValueStore, MemoryStore};
use tokio::{net::TcpListener, sync::Mutex};
use url::Url;

use crate::{
    config::ClientSettings,
    csrf::{CsrfGuard, HttpCsrfSource},
    gateway::RemoteGateway,
    session::TokenManager,
};

pub const TEST_USER_ID: &str = "u-alice";
pub const TEST_USERNAME: &str = "alice";
pub const TEST_PASSWORD: &str = "correct";

#[derive(Serialize)]
struct TestClaims<'a> {
    id: &'a str,
    user: &'a str,
    email: &'a str,
    avatar: &'a str,
    iat: i64,
    exp: i64,
}

/// Signs a token the way the chat API does; the client never checks the
/// signature, only the claims.
pub fn make_token(user_id: &str, username: &str, expires_in_secs: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = TestClaims {
        id: user_id,
        user: username,
        email: "alice@example.com",
        avatar: "https://i.pravatar.cc/200?u=alice",
        iat: now,
        exp: now + expires_in_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"mock-api-secret"),
    )
    .expect("encode token")
}

pub fn alice_token() -> String {
    make_token(TEST_USER_ID, TEST_USERNAME, 3600)
}

pub struct MockState {
    pub csrf_fetches: usize,
    pub csrf_delay: Option<Duration>,
    pub reject_csrf_once: bool,
    pub fail_csrf: bool,
    pub users: HashMap<String, (String, String)>,
    pub token_ttl_secs: i64,
    pub omit_login_token: bool,
    pub revoke_sessions: bool,
    pub messages: Vec<Value>,
    pub next_id: u64,
    pub wrap_created: bool,
    pub list_status: Option<StatusCode>,
    pub list_delay: Option<Duration>,
    pub send_status: Option<StatusCode>,
    pub delete_status: Option<StatusCode>,
    pub list_requests: usize,
    pub sent: Vec<Value>,
    pub deleted: Vec<String>,
    pub profile_updates: Vec<Value>,
    pub seen_bearers: Vec<Option<String>>,
    pub seen_csrf: Vec<Option<String>>,
}

impl Default for MockState {
    fn default() -> Self {
        let users = [(
            TEST_USERNAME.to_string(),
            (TEST_PASSWORD.to_string(), TEST_USER_ID.to_string()),
        )]
        .into_iter()
        .collect();
        Self {
            csrf_fetches: 0,
            csrf_delay: None,
            reject_csrf_once: false,
            fail_csrf: false,
            users,
            token_ttl_secs: 3600,
            omit_login_token: false,
            revoke_sessions: false,
            messages: Vec::new(),
            next_id: 100,
            wrap_created: false,
            list_status: None,
            list_delay: None,
            send_status: None,
            delete_status: None,
            list_requests: 0,
            sent: Vec::new(),
            deleted: Vec::new(),
            profile_updates: Vec::new(),
            seen_bearers: Vec::new(),
            seen_csrf: Vec::new(),
        }
    }
}

type SharedState = Arc<Mutex<MockState>>;

/// In-process stand-in for the chat REST API.
pub struct MockApi {
    pub base_url: String,
    pub state: SharedState,
}

impl MockApi {
    pub async fn spawn() -> Self {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock api");
        let addr = listener.local_addr().expect("mock api addr");
        let state: SharedState = Arc::new(Mutex::new(MockState::default()));

        let app = Router::new()
            .route("/csrf", patch(fetch_csrf))
            .route("/auth/token", post(issue_token))
            .route("/auth/register", post(register_user))
            .route("/messages", get(list_messages).post(create_message))
            .route("/messages/:id", axum::routing::delete(delete_message))
            .route("/users/:id", get(get_user))
            .route("/user", put(update_user))
            .route("/plain", get(plain_text))
            .route("/boom", get(server_error))
            .with_state(Arc::clone(&state));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn url(&self) -> Url {
        Url::parse(&self.base_url).expect("mock url")
    }

    pub fn settings(&self) -> ClientSettings {
        ClientSettings {
            api_url: self.base_url.clone(),
            database_url: "sqlite::memory:".into(),
            poll_interval: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Gateway plus token manager over an in-memory slot store.
    pub fn gateway(&self) -> (Arc<RemoteGateway>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let gateway = self.gateway_over(store.clone());
        (gateway, store)
    }

    pub fn gateway_over(&self, store: Arc<dyn KeyValueStore>) -> Arc<RemoteGateway> {
        let http = Client::new();
        let url = self.url();
        let tokens = Arc::new(TokenManager::new(store));
        let csrf = Arc::new(CsrfGuard::new(Arc::new(HttpCsrfSource::new(
            http.clone(),
            &url,
        ))));
        Arc::new(RemoteGateway::new(http, &url, tokens, csrf))
    }

    pub async fn seed_message(
        &self,
        conversation_id: &str,
        id: &str,
        content: &str,
        created_at: &str,
    ) {
        self.state.lock().await.messages.push(json!({
            "id": id,
            "text": content,
            "userId": "u-bob",
            "username": "bob",
            "avatar": "https://i.pravatar.cc/200?u=bob",
            "conversationId": conversation_id,
            "createdAt": created_at,
        }));
    }

    pub async fn server_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .messages
            .iter()
            .filter_map(|m| m.get("id").map(value_id))
            .collect()
    }
}

fn value_id(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Records the request headers and enforces the CSRF header.
async fn check_csrf(state: &SharedState, headers: &HeaderMap) -> Option<Response> {
    let mut state = state.lock().await;
    let csrf = header_value(headers, "x-csrf-token");
    state.seen_csrf.push(csrf.clone());
    state
        .seen_bearers
        .push(header_value(headers, "authorization").map(|v| v.trim_start_matches("Bearer ").to_string()));

    if csrf.is_none() {
        return Some(error_response(StatusCode::FORBIDDEN, "Missing CSRF token"));
    }
    if state.reject_csrf_once {
        state.reject_csrf_once = false;
        return Some(error_response(StatusCode::FORBIDDEN, "Invalid CSRF token"));
    }
    None
}

async fn check_bearer(state: &SharedState, headers: &HeaderMap) -> Option<Response> {
    let revoked = state.lock().await.revoke_sessions;
    match header_value(headers, "authorization") {
        Some(value) if value.starts_with("Bearer ") && !revoked => None,
        _ => Some(error_response(StatusCode::UNAUTHORIZED, "Invalid or expired token")),
    }
}

async fn fetch_csrf(State(state): State<SharedState>) -> Response {
    let (delay, fail, n) = {
        let mut state = state.lock().await;
        state.csrf_fetches += 1;
        (state.csrf_delay, state.fail_csrf, state.csrf_fetches)
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if fail {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "csrf unavailable");
    }
    Json(json!({ "csrf_token": format!("csrf-{n}") })).into_response()
}

async fn issue_token(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(rejection) = check_csrf(&state, &headers).await {
        return rejection;
    }
    let username = body["username"].as_str().unwrap_or_default().to_string();
    let password = body["password"].as_str().unwrap_or_default();

    let state = state.lock().await;
    match state.users.get(&username) {
        Some((expected, user_id)) if expected == password => {
            if state.omit_login_token {
                return Json(json!({ "user": { "id": user_id } })).into_response();
            }
            let token = make_token(user_id, &username, state.token_ttl_secs);
            Json(json!({ "token": token, "user": { "id": user_id, "username": username } }))
                .into_response()
        }
        _ => error_response(StatusCode::UNAUTHORIZED, "Invalid credentials"),
    }
}

async fn register_user(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(rejection) = check_csrf(&state, &headers).await {
        return rejection;
    }
    let username = body["username"].as_str().unwrap_or_default().to_string();
    let password = body["password"].as_str().unwrap_or_default().to_string();

    let mut state = state.lock().await;
    if state.users.contains_key(&username) {
        return error_response(StatusCode::BAD_REQUEST, "Username or email already exists");
    }
    let user_id = format!("u-{username}");
    state.users.insert(username, (password, user_id));
    (
        StatusCode::CREATED,
        Json(json!({ "message": "User registered successfully" })),
    )
        .into_response()
}

async fn list_messages(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Some(rejection) = check_csrf(&state, &headers).await {
        return rejection;
    }
    if let Some(rejection) = check_bearer(&state, &headers).await {
        return rejection;
    }

    // The snapshot is taken on arrival; `list_delay` only holds back the reply.
    let conversation_id = query.get("conversationId").cloned().unwrap_or_default();
    let (delay, forced, messages) = {
        let mut state = state.lock().await;
        state.list_requests += 1;
        let messages: Vec<Value> = state
            .messages
            .iter()
            .filter(|m| m["conversationId"].as_str() == Some(conversation_id.as_str()))
            .cloned()
            .collect();
        (state.list_delay, state.list_status, messages)
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if let Some(status) = forced {
        return error_response(status, "listing failed");
    }
    Json(messages).into_response()
}

async fn create_message(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(rejection) = check_csrf(&state, &headers).await {
        return rejection;
    }
    if let Some(rejection) = check_bearer(&state, &headers).await {
        return rejection;
    }

    let mut state = state.lock().await;
    state.sent.push(body.clone());
    if let Some(status) = state.send_status {
        return error_response(status, "message rejected");
    }

    state.next_id += 1;
    let record = json!({
        "id": state.next_id,
        "text": body["content"],
        "userId": body["userId"],
        "conversationId": body["conversationId"],
        "createdAt": Utc::now().to_rfc3339(),
    });
    state.messages.push(record.clone());
    let response = if state.wrap_created {
        json!({ "latestMessage": record })
    } else {
        record
    };
    (StatusCode::CREATED, Json(response)).into_response()
}

async fn delete_message(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Some(rejection) = check_csrf(&state, &headers).await {
        return rejection;
    }
    if let Some(rejection) = check_bearer(&state, &headers).await {
        return rejection;
    }

    let mut state = state.lock().await;
    state.deleted.push(id.clone());
    if let Some(status) = state.delete_status {
        return error_response(status, "delete failed");
    }
    let before = state.messages.len();
    state.messages.retain(|m| value_id(&m["id"]) != id);
    if state.messages.len() == before {
        return error_response(StatusCode::NOT_FOUND, "Message not found");
    }
    Json(json!({ "message": "Message deleted" })).into_response()
}

async fn get_user(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Some(rejection) = check_csrf(&state, &headers).await {
        return rejection;
    }
    if let Some(rejection) = check_bearer(&state, &headers).await {
        return rejection;
    }
    let state = state.lock().await;
    match state.users.iter().find(|(_, (_, user_id))| *user_id == id) {
        Some((username, (_, user_id))) => Json(json!({
            "id": user_id,
            "username": username,
            "email": format!("{username}@example.com"),
            "avatar": null,
        }))
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "User not found"),
    }
}

async fn update_user(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(rejection) = check_csrf(&state, &headers).await {
        return rejection;
    }
    if let Some(rejection) = check_bearer(&state, &headers).await {
        return rejection;
    }
    state.lock().await.profile_updates.push(body);
    Json(json!({ "message": "User data updated" })).into_response()
}

async fn plain_text(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Some(rejection) = check_csrf(&state, &headers).await {
        return rejection;
    }
    "pong".into_response()
}

async fn server_error(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Some(rejection) = check_csrf(&state, &headers).await {
        return rejection;
    }
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "kaboom")
}

/// Slot store whose writes can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_saves: AtomicBool,
    fail_next_save: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Fails only the next write.
    pub fn fail_next_save(&self) {
        self.fail_next_save.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn load(&self, slot: &str) -> Result<Option<String>> {
        self.inner.load(slot).await
    }

    async fn save(&self, slot: &str, value: &str) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) || self.fail_next_save.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        self.inner.save(slot, value).await
    }

    async fn remove(&self, slot: &str) -> Result<()> {
        self.inner.remove(slot).await
    }
}
