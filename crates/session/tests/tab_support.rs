// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared infrastructure for multi-instance tests: a small identity provider
//! and helpers to open several "tabs" on one origin.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
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

use desk_session::clock::system_clock;
use desk_session::config::SessionConfig;
use desk_session::event::SessionEvent;
use desk_session::medium::SharedMediumRef;
use desk_session::SessionManager;

#[derive(Default)]
pub struct Counters {
    pub login: AtomicU32,
    pub refresh: AtomicU32,
    pub me: AtomicU32,
    pub logout: AtomicU32,
    pub tickets: AtomicU32,
}

impl Counters {
    pub fn total(&self) -> u32 {
        [&self.login, &self.refresh, &self.me, &self.logout, &self.tickets]
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .sum()
    }
}

#[derive(Default)]
struct Idp {
    counters: Counters,
    valid: Mutex<HashSet<String>>,
    seq: AtomicU64,
}

impl Idp {
    fn mint(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let exp = SystemTime::now() + Duration::from_secs(3600);
        let exp = exp.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let body = URL_SAFE_NO_PAD.encode(json!({ "exp": exp, "sub": "7", "jti": seq }).to_string());
        let token = format!("{header}.{body}.c2ln");
        self.valid.lock().insert(token.clone());
        token
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|t| self.valid.lock().contains(t))
    }
}

fn user() -> Value {
    json!({ "id": 7, "username": "agent", "email": "agent@example.com", "roles": [], "organizations": [] })
}

/// A running identity provider.
pub struct Provider {
    pub base_url: String,
    idp: Arc<Idp>,
}

impl Provider {
    pub fn counters(&self) -> &Counters {
        &self.idp.counters
    }

    /// Invalidate every issued access token.
    pub fn expire_all(&self) {
        self.idp.valid.lock().clear();
    }

    pub fn config(&self) -> SessionConfig {
        SessionConfig { api_url: self.base_url.clone(), ..SessionConfig::default() }
    }

    pub fn open_tab(&self, medium: SharedMediumRef) -> SessionManager {
        SessionManager::new(&self.config(), medium, system_clock()).expect("open tab")
    }
}

pub async fn start_provider() -> Provider {
    let idp = Arc::new(Idp::default());
    let app = Router::new()
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/me", get(me))
        .route("/logout", post(logout))
        .route("/tickets", get(tickets))
        .with_state(Arc::clone(&idp));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Provider { base_url: format!("http://{addr}"), idp }
}

async fn login(State(idp): State<Arc<Idp>>) -> Json<Value> {
    idp.counters.login.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "accessToken": idp.mint(), "refreshToken": "r", "identity": user() }))
}

async fn refresh(State(idp): State<Arc<Idp>>) -> Json<Value> {
    idp.counters.refresh.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "accessToken": idp.mint() }))
}

async fn me(State(idp): State<Arc<Idp>>, headers: HeaderMap) -> Response {
    idp.counters.me.fetch_add(1, Ordering::SeqCst);
    if !idp.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(user()).into_response()
}

async fn logout(State(idp): State<Arc<Idp>>) -> StatusCode {
    idp.counters.logout.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn tickets(State(idp): State<Arc<Idp>>, headers: HeaderMap) -> Response {
    idp.counters.tickets.fetch_add(1, Ordering::SeqCst);
    if !idp.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!([])).into_response()
}

/// Wait until `pred` matches an event, or fail after five seconds.
pub async fn wait_for_event(
    rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}
