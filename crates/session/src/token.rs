// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Access token claim decoding.
//!
//! Reads the payload segment of a JWT-shaped token without verifying the
//! signature; the server is the authority on validity. Refresh tokens are
//! opaque and never pass through here.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;

use crate::error::SessionError;

/// Claims read from an access token payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Claims {
    /// Expiry as seconds since the Unix epoch.
    #[serde(default)]
    pub exp: Option<u64>,
    /// Subject. Some issuers use `user_id` instead of `sub`.
    #[serde(default, alias = "user_id", deserialize_with = "subject_as_string")]
    pub sub: Option<String>,
}

/// Decode the claims of a JWT-shaped token.
pub fn decode(token: &str) -> Result<Claims, SessionError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(SessionError::MalformedToken("expected three dot-separated segments".into()));
    };
    if header.is_empty() || payload.is_empty() {
        return Err(SessionError::MalformedToken("empty segment".into()));
    }
    decode_segment(header)?;
    if !signature.is_empty() && decode_segment(signature).is_err() {
        return Err(SessionError::MalformedToken("signature is not base64url".into()));
    }
    let bytes = decode_segment(payload)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SessionError::MalformedToken(format!("payload is not a claims object: {e}")))
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, SessionError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .or_else(|_| URL_SAFE.decode(segment))
        .map_err(|e| SessionError::MalformedToken(format!("invalid base64url: {e}")))
}

fn subject_as_string<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(de)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Expiry instant of a token, or `None` when it cannot be decoded or has no
/// `exp` claim.
pub fn expiry_of(token: &str) -> Option<SystemTime> {
    let exp = decode(token).ok()?.exp?;
    UNIX_EPOCH.checked_add(Duration::from_secs(exp))
}

/// Subject of a token, if decodable.
pub fn subject_of(token: &str) -> Option<String> {
    decode(token).ok()?.sub
}

/// True when the expiry is unknown or `now` is at or past it.
pub fn is_expired(token: &str, now: SystemTime) -> bool {
    match expiry_of(token) {
        Some(expiry) => now >= expiry,
        None => true,
    }
}

/// When proactive renewal should happen: `expiry - lead`, never earlier than
/// `now`. `None` when the expiry is unknown (reactive renewal only).
pub fn lead_refresh_instant(token: &str, lead: Duration, now: SystemTime) -> Option<SystemTime> {
    let expiry = expiry_of(token)?;
    let target = expiry.checked_sub(lead).unwrap_or(UNIX_EPOCH);
    Some(target.max(now))
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
