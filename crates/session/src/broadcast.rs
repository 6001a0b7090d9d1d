// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-instance fan-out of logout and session changes.
//!
//! The medium never notifies the writer, so a broadcast is a transient
//! marker: set (siblings fire once) then removed (removals are ignored).
//! Inbound handling only touches the local store and never broadcasts.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{epoch_ms, SharedClock};
use crate::medium::{keys, SharedMediumRef, StorageChange};
use crate::store::SessionStore;

/// Payload of a broadcast marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub origin: String,
    pub at_ms: u64,
}

/// Claim on the refresh exchange, shared through the medium so siblings
/// renewing the same token wait for one exchange instead of racing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalLease {
    pub origin: String,
    pub until_ms: u64,
}

/// A signal received from a sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundSignal {
    Logout,
    SessionChanged,
}

impl InboundSignal {
    /// Classify a storage change. Removals and unrelated keys are not signals.
    pub fn from_change(change: &StorageChange) -> Option<Self> {
        change.value.as_ref()?;
        match change.key.as_str() {
            keys::LOGOUT_MARKER => Some(Self::Logout),
            keys::SESSION_MARKER => Some(Self::SessionChanged),
            _ => None,
        }
    }
}

pub struct CrossTabBroadcaster {
    medium: SharedMediumRef,
    store: Arc<SessionStore>,
    clock: SharedClock,
}

impl CrossTabBroadcaster {
    pub fn new(medium: SharedMediumRef, store: Arc<SessionStore>, clock: SharedClock) -> Self {
        Self { medium, store, clock }
    }

    /// Tell siblings this instance logged out.
    pub fn broadcast_logout(&self) {
        info!("broadcasting logout");
        self.publish(keys::LOGOUT_MARKER);
    }

    /// Tell siblings the session was renewed or re-established.
    pub fn broadcast_session_change(&self) {
        debug!("broadcasting session change");
        self.publish(keys::SESSION_MARKER);
    }

    fn publish(&self, key: &str) {
        let marker =
            Marker { origin: self.medium.origin().to_owned(), at_ms: epoch_ms(self.clock.now()) };
        let value = match serde_json::to_value(&marker) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, err = %e, "failed to encode broadcast marker");
                return;
            }
        };
        if let Err(e) = self.medium.set(key, &value) {
            warn!(key, err = %e, "failed to publish broadcast marker");
            return;
        }
        if let Err(e) = self.medium.remove(key) {
            warn!(key, err = %e, "failed to clear broadcast marker");
        }
    }

    /// Try to become the one instance renewing for the next `ttl`. Returns
    /// `false` while a sibling holds an unexpired lease. A medium that cannot
    /// be written does not block renewal.
    pub fn try_claim_renewal(&self, ttl: Duration) -> bool {
        let origin = self.medium.origin();
        let now = epoch_ms(self.clock.now());
        if let Some(lease) = self.current_lease() {
            if lease.origin != origin && lease.until_ms > now {
                debug!(holder = %lease.origin, "sibling holds the renewal lease");
                return false;
            }
        }

        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let lease = RenewalLease { origin: origin.to_owned(), until_ms: now.saturating_add(ttl_ms) };
        let written = serde_json::to_value(&lease)
            .map_err(anyhow::Error::from)
            .and_then(|value| self.medium.set(keys::RENEWAL_LEASE, &value));
        if let Err(e) = written {
            warn!(err = %e, "failed to record renewal lease");
            return true;
        }
        // Last writer wins when two siblings claim at once.
        self.current_lease().is_none_or(|held| held.origin == origin)
    }

    /// Drop the lease if this instance still holds it.
    pub fn release_renewal(&self) {
        let held = self.current_lease().is_some_and(|l| l.origin == self.medium.origin());
        if !held {
            return;
        }
        if let Err(e) = self.medium.remove(keys::RENEWAL_LEASE) {
            warn!(err = %e, "failed to release renewal lease");
        }
    }

    fn current_lease(&self) -> Option<RenewalLease> {
        match self.medium.get(keys::RENEWAL_LEASE) {
            Ok(value) => serde_json::from_value(value?).ok(),
            Err(e) => {
                warn!(err = %e, "failed to read renewal lease");
                None
            }
        }
    }

    /// Apply one change observed on the medium. Returns the signal acted on.
    pub fn handle_change(&self, change: &StorageChange) -> Option<InboundSignal> {
        let signal = InboundSignal::from_change(change)?;
        match signal {
            InboundSignal::Logout => {
                info!("sibling logged out");
                self.store.apply_remote_logout();
            }
            InboundSignal::SessionChanged => {
                debug!("sibling changed session, reloading mirror");
                self.store.reload_from_mirror();
            }
        }
        Some(signal)
    }

    /// Start applying sibling changes until `shutdown` fires. Subscribes
    /// before returning, so no change made after this call is missed.
    pub fn spawn_listener(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut changes = self.medium.subscribe();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    change = changes.recv() => change,
                };
                match change {
                    Ok(change) => {
                        this.handle_change(&change);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed sibling changes, reloading mirror");
                        this.store.reload_from_mirror();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("broadcast listener stopped");
        })
    }
}

#[cfg(test)]
#[path = "broadcast_tests.rs"]
mod tests;
