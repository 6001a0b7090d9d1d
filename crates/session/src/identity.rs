// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP client for the identity provider: login, register, refresh, `/me`,
//! logout. Response bodies are treated as opaque apart from the fields named
//! here.

use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

/// Error code some servers attach to a 403 when the bearer token is invalid.
pub const TOKEN_NOT_VALID: &str = "token_not_valid";

/// Access/refresh token pair. The refresh token is never decoded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
    #[serde(alias = "access", alias = "access_token")]
    pub access_token: String,
    #[serde(alias = "refresh", alias = "refresh_token")]
    pub refresh_token: String,
}

impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// An organization (tenant) the user belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: u64,
    pub name: String,
}

/// Authenticated identity as returned by `/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "groups")]
    pub roles: Vec<String>,
    #[serde(default, alias = "companies")]
    pub organizations: Vec<Organization>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

/// Body of a successful login or registration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    #[serde(alias = "access", alias = "access_token")]
    pub access_token: String,
    #[serde(alias = "refresh", alias = "refresh_token")]
    pub refresh_token: String,
    #[serde(alias = "user")]
    pub identity: User,
}

impl AuthResponse {
    pub fn into_parts(self) -> (CredentialPair, User) {
        let creds =
            CredentialPair { access_token: self.access_token, refresh_token: self.refresh_token };
        (creds, self.identity)
    }
}

/// Body of a successful refresh. The refresh token is present only when the
/// server rotates it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    #[serde(alias = "access", alias = "access_token")]
    access_token: String,
    #[serde(default, alias = "refresh", alias = "refresh_token")]
    refresh_token: Option<String>,
}

/// What an outbound call is, for recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Login,
    Register,
    Refresh,
    Me,
    Logout,
    /// Any other authenticated API call (tickets, companies, ...).
    Resource,
}

impl Endpoint {
    /// Auth endpoints are never retried after an authorization failure.
    pub fn is_auth_endpoint(&self) -> bool {
        matches!(self, Self::Login | Self::Register | Self::Refresh)
    }

    /// Whether the current bearer credential is attached.
    pub fn attaches_bearer(&self) -> bool {
        matches!(self, Self::Me | Self::Logout | Self::Resource)
    }
}

/// A fully-read HTTP response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 401, or 403 whose body carries [`TOKEN_NOT_VALID`].
    pub fn is_authorization_failure(&self) -> bool {
        match self.status {
            401 => true,
            403 => serde_json::from_slice::<serde_json::Value>(&self.body)
                .ok()
                .and_then(|v| v.get("code").and_then(|c| c.as_str()).map(|c| c == TOKEN_NOT_VALID))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Turn a non-success status into [`SessionError::Api`].
    pub fn error_for_status(self) -> SessionResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SessionError::Api { status: self.status, body: self.text() })
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> SessionResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| SessionError::Api {
            status: self.status,
            body: format!("unexpected response body: {e}"),
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

static CRYPTO_INIT: Once = Once::new();

/// Install the rustls crypto provider (needed for reqwest even on plain HTTP).
pub fn ensure_crypto_provider() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Thin wrapper over `reqwest` bound to the API base URL.
pub struct IdentityClient {
    base_url: String,
    http: reqwest::Client,
}

impl IdentityClient {
    pub fn new(base_url: &str, timeout: Duration) -> SessionResult<Self> {
        ensure_crypto_provider();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SessionError::Transport(format!("build HTTP client: {e}")))?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_owned(), http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn login_request(&self, body: &LoginRequest) -> reqwest::RequestBuilder {
        self.http.post(self.url("/login")).json(body)
    }

    pub fn register_request(&self, body: &RegisterRequest) -> reqwest::RequestBuilder {
        self.http.post(self.url("/register")).json(body)
    }

    pub fn me_request(&self) -> reqwest::RequestBuilder {
        self.http.get(self.url("/me"))
    }

    pub fn logout_request(&self) -> reqwest::RequestBuilder {
        self.http.post(self.url("/logout"))
    }

    /// Exchange a refresh token for a new access token. One network call, no
    /// retries; any non-success status is a [`SessionError::RefreshFailed`].
    pub async fn refresh(&self, refresh_token: &str) -> SessionResult<(String, Option<String>)> {
        let resp = self
            .http
            .post(self.url("/refresh"))
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(|e| SessionError::RefreshFailed(format!("HTTP error: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| SessionError::RefreshFailed(format!("read body: {e}")))?;

        if !status.is_success() {
            return Err(SessionError::RefreshFailed(format!(
                "refresh rejected ({}): {body}",
                status.as_u16()
            )));
        }

        let token: RefreshResponse = serde_json::from_str(&body)
            .map_err(|e| SessionError::RefreshFailed(format!("parse response: {e}")))?;
        Ok((token.access_token, token.refresh_token))
    }
}

/// Send a request and read the whole body.
pub async fn send(req: reqwest::RequestBuilder) -> SessionResult<ApiResponse> {
    let resp = req.send().await?;
    let status = resp.status().as_u16();
    let body = resp.bytes().await?;
    Ok(ApiResponse { status, body })
}

#[cfg(test)]
#[path = "identity_tests.rs"]
mod tests;
