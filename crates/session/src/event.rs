// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::Serialize;

/// Why a session was cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearCause {
    /// This instance logged out.
    Logout,
    /// Recovery failed (refresh rejected, replay rejected, auth endpoint 401).
    AuthenticationFailed,
    /// A sibling instance logged out.
    RemoteLogout,
    /// The durable mirror was found empty while syncing from a sibling.
    RemoteCleared,
}

/// Events emitted by the session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A new session was established by login or registration.
    Established { username: String },
    /// A persisted session was restored at bootstrap.
    Restored { username: String },
    /// The access token was renewed in this instance.
    Renewed,
    /// `/me` was refetched.
    IdentityRefreshed { username: String },
    /// In-memory state was reloaded from the mirror after a sibling changed it.
    Synced,
    Cleared { cause: ClearCause },
    /// The host should navigate to the unauthenticated entry point.
    LoginRequired { reason: String },
}
