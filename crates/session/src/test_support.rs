// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for unit tests: token minting, a mock identity provider and
//! assertion macros.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::clock::{Clock, ManualClock, SharedClock};
use crate::identity::User;

/// Assert that `$expr` is `Err` and its message contains `$substr`.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}

/// Fixed starting point for manual clocks.
pub fn t0() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

pub fn manual_clock() -> Arc<ManualClock> {
    ManualClock::new(t0())
}

/// Build an unsigned JWT-shaped token around `payload`.
pub fn jwt_with(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    let sig = URL_SAFE_NO_PAD.encode(b"signature");
    format!("{header}.{body}.{sig}")
}

/// Token expiring at `exp`.
pub fn jwt(exp: SystemTime) -> String {
    let secs = exp.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    jwt_with(&json!({ "exp": secs, "sub": "7" }))
}

pub fn test_user() -> User {
    User {
        id: 7,
        username: "agent".to_owned(),
        email: "agent@example.com".to_owned(),
        roles: vec!["agent".to_owned()],
        organizations: vec![crate::identity::Organization { id: 1, name: "Acme".to_owned() }],
    }
}

/// Behaviour knobs and hit counters of the mock identity provider.
pub struct IdpState {
    pub clock: SharedClock,
    pub access_lifetime: Mutex<Duration>,
    pub refresh_delay: Mutex<Duration>,
    /// Status returned by `/refresh`; 200 means success.
    pub refresh_status: AtomicU16,
    /// When set, `/refresh` returns a new refresh token.
    pub rotate_refresh: AtomicBool,
    /// When set, rejected resource calls answer 403 `token_not_valid`.
    pub reject_with_403: AtomicBool,
    /// When set, `/me` answers 500.
    pub me_fails: AtomicBool,
    /// When set, tokens minted by `/refresh` are already revoked.
    pub refresh_mints_revoked: AtomicBool,
    pub login_calls: AtomicU32,
    pub refresh_calls: AtomicU32,
    pub me_calls: AtomicU32,
    pub logout_calls: AtomicU32,
    pub resource_calls: AtomicU32,
    valid_access: Mutex<HashSet<String>>,
    seq: AtomicU64,
}

impl IdpState {
    fn mint(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let exp = self.clock.now() + *self.access_lifetime.lock();
        let secs = exp.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let token = jwt_with(&json!({ "exp": secs, "sub": "7", "jti": seq }));
        self.valid_access.lock().insert(token.clone());
        token
    }

    /// Issue a valid access token without going through login.
    pub fn issue_access(&self) -> String {
        self.mint()
    }

    /// Invalidate every issued access token (simulates server-side expiry).
    pub fn revoke_all_access(&self) {
        self.valid_access.lock().clear();
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(token) = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        else {
            return false;
        };
        self.valid_access.lock().contains(token)
    }

    fn rejection(&self) -> Response {
        if self.reject_with_403.load(Ordering::Relaxed) {
            (StatusCode::FORBIDDEN, Json(json!({ "code": "token_not_valid" }))).into_response()
        } else {
            (StatusCode::UNAUTHORIZED, Json(json!({ "detail": "expired" }))).into_response()
        }
    }
}

/// A running mock identity provider.
pub struct MockIdp {
    pub addr: SocketAddr,
    pub state: Arc<IdpState>,
}

impl MockIdp {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn refresh_calls(&self) -> u32 {
        self.state.refresh_calls.load(Ordering::Relaxed)
    }

    pub fn me_calls(&self) -> u32 {
        self.state.me_calls.load(Ordering::Relaxed)
    }

    pub fn resource_calls(&self) -> u32 {
        self.state.resource_calls.load(Ordering::Relaxed)
    }

    pub fn logout_calls(&self) -> u32 {
        self.state.logout_calls.load(Ordering::Relaxed)
    }
}

pub async fn spawn_idp(clock: SharedClock) -> MockIdp {
    let state = Arc::new(IdpState {
        clock,
        access_lifetime: Mutex::new(Duration::from_secs(3600)),
        refresh_delay: Mutex::new(Duration::ZERO),
        refresh_status: AtomicU16::new(200),
        rotate_refresh: AtomicBool::new(false),
        reject_with_403: AtomicBool::new(false),
        me_fails: AtomicBool::new(false),
        refresh_mints_revoked: AtomicBool::new(false),
        login_calls: AtomicU32::new(0),
        refresh_calls: AtomicU32::new(0),
        me_calls: AtomicU32::new(0),
        logout_calls: AtomicU32::new(0),
        resource_calls: AtomicU32::new(0),
        valid_access: Mutex::new(HashSet::new()),
        seq: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/login", post(login))
        .route("/register", post(login))
        .route("/refresh", post(refresh))
        .route("/me", get(me))
        .route("/logout", post(logout))
        .route("/tickets", get(tickets))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    MockIdp { addr, state }
}

async fn login(State(s): State<Arc<IdpState>>, Json(body): Json<Value>) -> Response {
    s.login_calls.fetch_add(1, Ordering::Relaxed);
    if body.get("password").and_then(|p| p.as_str()) != Some("secret") {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "detail": "bad credentials" })))
            .into_response();
    }
    let access = s.mint();
    Json(json!({
        "accessToken": access,
        "refreshToken": "refresh-0",
        "identity": test_user(),
    }))
    .into_response()
}

async fn refresh(State(s): State<Arc<IdpState>>, Json(body): Json<Value>) -> Response {
    let n = s.refresh_calls.fetch_add(1, Ordering::Relaxed) + 1;
    let delay = *s.refresh_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let status = s.refresh_status.load(Ordering::Relaxed);
    if status != 200 {
        let code = StatusCode::from_u16(status).unwrap_or(StatusCode::UNAUTHORIZED);
        return (code, Json(json!({ "code": "token_not_valid" }))).into_response();
    }
    if body.get("refreshToken").and_then(|r| r.as_str()).is_none() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "detail": "missing refresh" })))
            .into_response();
    }
    let access = s.mint();
    if s.refresh_mints_revoked.load(Ordering::Relaxed) {
        s.valid_access.lock().remove(&access);
    }
    if s.rotate_refresh.load(Ordering::Relaxed) {
        Json(json!({ "accessToken": access, "refreshToken": format!("refresh-{n}") }))
            .into_response()
    } else {
        Json(json!({ "access": access })).into_response()
    }
}

async fn me(State(s): State<Arc<IdpState>>, headers: HeaderMap) -> Response {
    s.me_calls.fetch_add(1, Ordering::Relaxed);
    if !s.authorized(&headers) {
        return s.rejection();
    }
    if s.me_fails.load(Ordering::Relaxed) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }
    Json(test_user()).into_response()
}

async fn logout(State(s): State<Arc<IdpState>>) -> StatusCode {
    s.logout_calls.fetch_add(1, Ordering::Relaxed);
    StatusCode::NO_CONTENT
}

async fn tickets(State(s): State<Arc<IdpState>>, headers: HeaderMap) -> Response {
    s.resource_calls.fetch_add(1, Ordering::Relaxed);
    if !s.authorized(&headers) {
        return s.rejection();
    }
    Json(json!([{ "id": 1, "title": "Printer on fire" }])).into_response()
}
