// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable per-origin key-value medium shared between sibling instances.
//!
//! Every instance ("tab") of the client holds one handle. Writes are visible
//! to every handle; change notifications are delivered only to handles other
//! than the writer.

pub mod file;
pub mod memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Keys used in the medium. Values are JSON.
pub mod keys {
    /// Serialized credential pair.
    pub const CREDENTIALS: &str = "desk.credentials";
    /// Serialized identity snapshot.
    pub const IDENTITY: &str = "desk.identity";
    /// Epoch millis of the last successful `/me` fetch.
    pub const IDENTITY_FETCHED_AT: &str = "desk.identity_fetched_at";
    /// Transient marker: a sibling logged out.
    pub const LOGOUT_MARKER: &str = "desk.logout";
    /// Transient marker: a sibling renewed or re-established the session.
    pub const SESSION_MARKER: &str = "desk.session_changed";
    /// Which instance is currently exchanging the refresh token, and until when.
    pub const RENEWAL_LEASE: &str = "desk.renewal_lease";
}

/// A change made by another handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageChange {
    pub key: String,
    /// New value, or `None` when the key was removed.
    pub value: Option<serde_json::Value>,
}

/// Shared storage with cross-handle change notification.
pub trait SharedMedium: Send + Sync {
    /// Identifier of this handle; stamped on every write it makes.
    fn origin(&self) -> &str;

    fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>>;

    fn set(&self, key: &str, value: &serde_json::Value) -> anyhow::Result<()>;

    fn remove(&self, key: &str) -> anyhow::Result<()>;

    /// Changes made by other handles. Never yields this handle's own writes.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

pub type SharedMediumRef = Arc<dyn SharedMedium>;

/// Capacity of per-handle change channels.
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 64;
