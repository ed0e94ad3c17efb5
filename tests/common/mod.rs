// Mock CourseHub backend for integration tests

#![allow(dead_code)]

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

pub const EMAIL: &str = "a@b.com";
pub const PASSWORD: &str = "secret1";
pub const LOGIN_TOKEN: &str = "access-1";

/// How the refresh endpoint answers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefreshMode {
    Succeed,
    Fail(u16),
}

#[derive(Default)]
struct BackendState {
    valid_token: Mutex<Option<String>>,
    refresh_mode: Mutex<Option<RefreshMode>>,
    refresh_gate: Mutex<Option<Arc<Semaphore>>>,
    refresh_count: AtomicUsize,
    refresh_saw_cookie: AtomicBool,
    logout_count: AtomicUsize,
    admin_hits: AtomicUsize,
    slow_hits: AtomicUsize,
    slow_delay_ms: AtomicU64,
    served: Mutex<Vec<String>>,
}

/// Handle to a running mock backend
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<BackendState>,
    url: String,
}

impl MockBackend {
    /// Start the backend on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock backend");
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(BackendState::default());
        state.slow_delay_ms.store(300, Ordering::SeqCst);
        let app = Router::new()
            .route("/api/login", post(handle_login))
            .route("/api/refresh-token", post(handle_refresh))
            .route("/api/logout", post(handle_logout))
            .route("/api/profile", get(handle_profile))
            .route("/api/courses/:id", get(handle_course))
            .route("/api/admin/stats", get(handle_admin))
            .route("/api/slow", get(handle_slow))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self {
            state,
            url: format!("http://127.0.0.1:{}", port),
        }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    /// Make the backend accept this access token (and only this one)
    pub fn accept_token(&self, token: &str) {
        *self.state.valid_token.lock().unwrap() = Some(token.to_string());
    }

    /// Reject every access token currently in circulation
    pub fn expire_tokens(&self) {
        *self.state.valid_token.lock().unwrap() = Some("rotated-out".to_string());
    }

    pub fn set_refresh_mode(&self, mode: RefreshMode) {
        *self.state.refresh_mode.lock().unwrap() = Some(mode);
    }

    /// Hold refresh responses until [`MockBackend::open_refresh_gate`]
    pub fn close_refresh_gate(&self) {
        *self.state.refresh_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open_refresh_gate(&self) {
        if let Some(gate) = self.state.refresh_gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn refresh_count(&self) -> usize {
        self.state.refresh_count.load(Ordering::SeqCst)
    }

    pub fn refresh_saw_cookie(&self) -> bool {
        self.state.refresh_saw_cookie.load(Ordering::SeqCst)
    }

    pub fn logout_count(&self) -> usize {
        self.state.logout_count.load(Ordering::SeqCst)
    }

    pub fn admin_hits(&self) -> usize {
        self.state.admin_hits.load(Ordering::SeqCst)
    }

    /// How long `/api/slow` works before it checks the token
    pub fn set_slow_delay(&self, delay: Duration) {
        self.state
            .slow_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn slow_hits(&self) -> usize {
        self.state.slow_hits.load(Ordering::SeqCst)
    }

    /// Course ids served successfully, in order
    pub fn served(&self) -> Vec<String> {
        self.state.served.lock().unwrap().clone()
    }
}

/// Poll until `condition` holds, panicking after a few seconds
pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for: {}", description);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "message": message }))).into_response()
}

fn bearer_is_valid(state: &BackendState, headers: &HeaderMap) -> bool {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let valid = state.valid_token.lock().unwrap();
    matches!((presented, valid.as_deref()), (Some(p), Some(v)) if p == v)
}

async fn handle_login(State(state): State<Arc<BackendState>>, Json(body): Json<Value>) -> Response {
    if body["email"] != EMAIL || body["password"] != PASSWORD {
        return unauthorized("Invalid credentials");
    }

    *state.valid_token.lock().unwrap() = Some(LOGIN_TOKEN.to_string());
    (
        [(header::SET_COOKIE, "refreshToken=r-1; Path=/; HttpOnly")],
        Json(json!({ "token": LOGIN_TOKEN, "message": "Login successful" })),
    )
        .into_response()
}

async fn handle_refresh(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    let count = state.refresh_count.fetch_add(1, Ordering::SeqCst) + 1;

    let has_cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("refreshToken="));
    if has_cookie {
        state.refresh_saw_cookie.store(true, Ordering::SeqCst);
    }

    let gate = state.refresh_gate.lock().unwrap().clone();
    if let Some(gate) = gate {
        let _permit = gate.acquire().await.unwrap();
    }

    let mode = state
        .refresh_mode
        .lock()
        .unwrap()
        .unwrap_or(RefreshMode::Succeed);
    match mode {
        RefreshMode::Succeed => {
            let token = format!("fresh-{}", count);
            *state.valid_token.lock().unwrap() = Some(token.clone());
            Json(json!({ "token": token })).into_response()
        }
        RefreshMode::Fail(status) => (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({ "message": "Refresh token expired" })),
        )
            .into_response(),
    }
}

async fn handle_logout(State(state): State<Arc<BackendState>>) -> Response {
    state.logout_count.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "message": "Logged out" })).into_response()
}

async fn handle_profile(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    if !bearer_is_valid(&state, &headers) {
        return unauthorized("jwt expired");
    }
    Json(json!({ "id": 42, "name": "Ada", "email": EMAIL, "role": "student" })).into_response()
}

async fn handle_course(
    State(state): State<Arc<BackendState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !bearer_is_valid(&state, &headers) {
        return unauthorized("jwt expired");
    }
    state.served.lock().unwrap().push(id.clone());
    Json(json!({ "id": id, "title": format!("Course {}", id) })).into_response()
}

/// Rejects every token, refreshed or not
async fn handle_admin(State(state): State<Arc<BackendState>>) -> Response {
    state.admin_hits.fetch_add(1, Ordering::SeqCst);
    unauthorized("Admin only")
}

/// Takes a while, then validates the token it was sent
async fn handle_slow(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    state.slow_hits.fetch_add(1, Ordering::SeqCst);
    let delay = state.slow_delay_ms.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(delay)).await;

    if !bearer_is_valid(&state, &headers) {
        return unauthorized("jwt expired");
    }
    state.served.lock().unwrap().push("slow".to_string());
    Json(json!({ "report": "ready" })).into_response()
}
