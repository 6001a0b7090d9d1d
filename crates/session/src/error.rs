// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the session lifecycle.
//!
//! Errors are `Clone` because a single failed renewal is delivered to every
//! caller queued behind it.

use thiserror::Error;

/// Errors surfaced by the session manager and its components.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The access token is not three base64url segments with a JSON payload.
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// The refresh exchange was rejected, timed out, or failed in transport.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// Recovery was exhausted; the session has been torn down.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// `/me` could not be fetched. Callers keep the cached identity.
    #[error("identity fetch failed: {0}")]
    IdentityFetchFailed(String),

    /// An authenticated call was attempted with no established session.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Network-level failure on a non-auth request.
    #[error("transport error: {0}")]
    Transport(String),

    /// The durable medium could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// Non-success HTTP response that is not an authorization failure.
    #[error("api error ({status}): {body}")]
    Api { status: u16, body: String },
}

impl SessionError {
    /// Whether this error ends the session (caller must re-authenticate).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_) | Self::NotAuthenticated)
    }

    /// Stable machine-readable code for logs and host UIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedToken(_) => "MALFORMED_TOKEN",
            Self::RefreshFailed(_) => "REFRESH_FAILED",
            Self::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Self::IdentityFetchFailed(_) => "IDENTITY_FETCH_FAILED",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::Transport(_) => "TRANSPORT",
            Self::Storage(_) => "STORAGE",
            Self::Api { .. } => "API",
        }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Result alias used across the crate.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
