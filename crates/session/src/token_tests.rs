// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use proptest::prelude::*;
use serde_json::json;

use super::*;
use crate::test_support::{jwt, jwt_with, t0};

#[test]
fn decodes_exp_and_subject() -> anyhow::Result<()> {
    let token = jwt_with(&json!({ "exp": 1_700_000_600u64, "sub": "42" }));
    let claims = decode(&token)?;
    assert_eq!(claims.exp, Some(1_700_000_600));
    assert_eq!(claims.sub.as_deref(), Some("42"));
    Ok(())
}

#[test]
fn numeric_user_id_becomes_subject() -> anyhow::Result<()> {
    let token = jwt_with(&json!({ "exp": 1u64, "user_id": 7 }));
    assert_eq!(decode(&token)?.sub.as_deref(), Some("7"));
    assert_eq!(subject_of(&token).as_deref(), Some("7"));
    Ok(())
}

#[test]
fn padded_payload_is_accepted() -> anyhow::Result<()> {
    let header = URL_SAFE.encode(br#"{"alg":"none"}"#);
    let payload = URL_SAFE.encode(br#"{"exp":12}"#);
    assert!(payload.ends_with('='), "fixture should exercise padding");
    let claims = decode(&format!("{header}.{payload}.sig"))?;
    assert_eq!(claims.exp, Some(12));
    Ok(())
}

#[test]
fn missing_exp_is_not_an_error() -> anyhow::Result<()> {
    let token = jwt_with(&json!({ "sub": "x" }));
    assert_eq!(decode(&token)?.exp, None);
    assert_eq!(expiry_of(&token), None);
    Ok(())
}

#[yare::parameterized(
    empty = { "" },
    one_segment = { "abc" },
    two_segments = { "abc.def" },
    four_segments = { "a.b.c.d" },
    empty_payload = { "eyJhbGciOiJub25lIn0..sig" },
    payload_not_base64 = { "eyJhbGciOiJub25lIn0.@@@.sig" },
    payload_not_json = { "eyJhbGciOiJub25lIn0.bm90LWpzb24.sig" },
)]
fn rejects_malformed(token: &str) {
    crate::assert_err_contains!(decode(token), "malformed token");
}

#[test]
fn expiry_of_malformed_is_none() {
    assert_eq!(expiry_of("garbage"), None);
}

#[test]
fn is_expired_boundaries() {
    let token = jwt(t0() + Duration::from_secs(60));
    assert!(!is_expired(&token, t0()));
    assert!(!is_expired(&token, t0() + Duration::from_secs(59)));
    assert!(is_expired(&token, t0() + Duration::from_secs(60)));
    assert!(is_expired(&token, t0() + Duration::from_secs(61)));
}

#[test]
fn unknown_expiry_counts_as_expired() {
    assert!(is_expired("not.a.jwt", t0()));
    assert!(is_expired(&jwt_with(&json!({ "sub": "1" })), t0()));
}

#[yare::parameterized(
    far_future = { 600, 120, 480 },
    exactly_at_lead = { 120, 120, 0 },
    inside_lead = { 120, 600, 0 },
    already_expired_clamped = { 0, 120, 0 },
)]
fn lead_refresh_instant_clamps_to_now(expires_in: u64, lead: u64, expected_delay: u64) {
    let token = jwt(t0() + Duration::from_secs(expires_in));
    let at = lead_refresh_instant(&token, Duration::from_secs(lead), t0());
    assert_eq!(at, Some(t0() + Duration::from_secs(expected_delay)));
}

#[test]
fn lead_refresh_instant_without_expiry_is_none() {
    assert_eq!(lead_refresh_instant("x.y.z", Duration::from_secs(60), t0()), None);
}

proptest! {
    #[test]
    fn decode_never_panics(s in ".{0,200}") {
        let _ = decode(&s);
    }

    #[test]
    fn lead_instant_never_before_now(
        expires_in in 0u64..100_000,
        lead in 0u64..100_000,
        elapsed in 0u64..100_000,
    ) {
        let token = jwt(t0() + Duration::from_secs(expires_in));
        let now = t0() + Duration::from_secs(elapsed);
        let at = lead_refresh_instant(&token, Duration::from_secs(lead), now);
        prop_assert!(at.is_some_and(|at| at >= now));
    }
}
