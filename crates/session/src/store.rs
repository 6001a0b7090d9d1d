// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Owner of the in-memory session and its durable mirror.
//!
//! Every mutation takes the state write lock, updates memory, writes the
//! mirror, re-arms or disarms the scheduler and only then releases the lock,
//! so a reader that runs after a mutation returns always sees its result.
//! The store never broadcasts to siblings itself; callers decide that.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{epoch_ms, from_epoch_ms, SharedClock};
use crate::error::{SessionError, SessionResult};
use crate::event::{ClearCause, SessionEvent};
use crate::identity::{CredentialPair, User};
use crate::medium::{keys, SharedMediumRef};
use crate::scheduler::RefreshScheduler;
use crate::token;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Result of [`SessionStore::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialUpdate {
    /// The renewed pair replaced the one it was minted from.
    Applied,
    /// A different session (re-login, sibling renewal) is current; left alone.
    Superseded,
    /// No session is established.
    Ended,
}

/// Point-in-time view of the session.
///
/// `credentials` and `identity` are either both present (authenticated) or
/// both absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub credentials: Option<CredentialPair>,
    pub identity: Option<User>,
    pub last_identity_fetch: Option<SystemTime>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some() && self.identity.is_some()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.access_token.as_str())
    }

    pub fn username(&self) -> Option<&str> {
        self.identity.as_ref().map(|u| u.username.as_str())
    }
}

pub struct SessionStore {
    state: RwLock<Session>,
    medium: SharedMediumRef,
    scheduler: Arc<RefreshScheduler>,
    clock: SharedClock,
    staleness_window: Duration,
    /// Serializes `/me` fetches so concurrent callers share one.
    identity_fetch: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionStore {
    pub fn new(
        medium: SharedMediumRef,
        scheduler: Arc<RefreshScheduler>,
        clock: SharedClock,
        staleness_window: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(Session::default()),
            medium,
            scheduler,
            clock,
            staleness_window,
            identity_fetch: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.scheduler
    }

    pub fn snapshot(&self) -> Session {
        self.state.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().is_authenticated()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.read().access_token().map(str::to_owned)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state.read().credentials.as_ref().map(|c| c.refresh_token.clone())
    }

    pub fn credentials(&self) -> Option<CredentialPair> {
        self.state.read().credentials.clone()
    }

    pub fn identity(&self) -> Option<User> {
        self.state.read().identity.clone()
    }

    /// Whether the cached identity is older than the staleness window.
    pub fn identity_is_stale(&self) -> bool {
        let last = self.state.read().last_identity_fetch;
        self.is_stale(last)
    }

    fn is_stale(&self, last: Option<SystemTime>) -> bool {
        match last {
            Some(at) => {
                let age = self.clock.now().duration_since(at).unwrap_or_default();
                age >= self.staleness_window
            }
            None => true,
        }
    }

    /// Load a persisted session into memory without arming the scheduler.
    ///
    /// A mirror holding only half a session (credentials without identity or
    /// the reverse) is discarded.
    pub fn restore(&self) -> Session {
        let mirrored = self.read_mirror();
        if !mirrored.is_authenticated() {
            if mirrored.credentials.is_some() || mirrored.identity.is_some() {
                warn!("discarding incomplete persisted session");
                self.wipe_mirror();
            }
            return Session::default();
        }

        *self.state.write() = mirrored.clone();
        if let Some(username) = mirrored.username() {
            info!(username, "session restored");
            self.emit(SessionEvent::Restored { username: username.to_owned() });
        }
        mirrored
    }

    /// Arm the scheduler against the current access token, if any.
    pub fn rearm(&self) {
        let state = self.state.read();
        if let Some(token) = state.access_token() {
            self.scheduler.arm(token);
        }
    }

    /// Install a freshly authenticated session.
    ///
    /// Fails with [`SessionError::Storage`] when the mirror cannot be
    /// written; memory is left untouched so siblings and this instance agree.
    pub fn establish(&self, credentials: CredentialPair, identity: User) -> SessionResult<()> {
        let username = identity.username.clone();
        {
            let mut state = self.state.write();
            let now = self.clock.now();
            self.persist_credentials(&credentials)?;
            if let Err(e) = self.persist_identity(&identity, now) {
                self.wipe_mirror();
                return Err(e);
            }
            self.scheduler.arm(&credentials.access_token);
            *state = Session {
                credentials: Some(credentials),
                identity: Some(identity),
                last_identity_fetch: Some(now),
            };
        }
        info!(username, "session established");
        self.emit(SessionEvent::Established { username });
        Ok(())
    }

    /// Swap in `credentials` renewed from `renewed_from`.
    ///
    /// Compare-and-swap: nothing changes unless `renewed_from` is still the
    /// current pair, so a renewal that outlives a logout (or a logout followed
    /// by a new login) cannot overwrite what replaced it.
    pub fn update(
        &self,
        renewed_from: &CredentialPair,
        credentials: CredentialPair,
    ) -> CredentialUpdate {
        {
            let mut state = self.state.write();
            if !state.is_authenticated() {
                debug!("ignoring credential update, session no longer established");
                return CredentialUpdate::Ended;
            }
            if state.credentials.as_ref() != Some(renewed_from) {
                debug!("ignoring credential update, session superseded");
                return CredentialUpdate::Superseded;
            }
            if let Err(e) = self.persist_credentials(&credentials) {
                warn!(err = %e, "renewed credentials kept in memory only");
            }
            self.scheduler.arm(&credentials.access_token);
            state.credentials = Some(credentials);
        }
        debug!("credentials updated");
        self.emit(SessionEvent::Renewed);
        CredentialUpdate::Applied
    }

    /// Install a renewal a sibling already wrote to the mirror in place of
    /// `renewing`. Returns `false` unless the mirror holds a different,
    /// unexpired pair and `renewing` is still current here.
    pub fn adopt_sibling_renewal(&self, renewing: &CredentialPair) -> bool {
        let mirrored = self.read_mirror();
        let Some(newer) = mirrored.credentials.as_ref() else {
            return false;
        };
        if !mirrored.is_authenticated()
            || newer == renewing
            || token::is_expired(&newer.access_token, self.clock.now())
        {
            return false;
        }
        {
            let mut state = self.state.write();
            if state.credentials.as_ref() != Some(renewing) {
                return false;
            }
            self.scheduler.arm(&newer.access_token);
            *state = mirrored;
        }
        info!("adopted renewal made by a sibling");
        self.emit(SessionEvent::Synced);
        true
    }

    /// Refetch identity through `fetch` when the cache is stale.
    ///
    /// A fresh cache is returned without calling `fetch`. Non-terminal fetch
    /// failures are logged and the cached identity is kept.
    pub async fn refresh_identity<F, Fut>(&self, fetch: F) -> SessionResult<User>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SessionResult<User>>,
    {
        let _guard = self.identity_fetch.lock().await;

        let (cached, last) = {
            let state = self.state.read();
            let Some(cached) = state.identity.clone() else {
                return Err(SessionError::NotAuthenticated);
            };
            (cached, state.last_identity_fetch)
        };
        if !self.is_stale(last) {
            debug!("identity cache fresh, skipping fetch");
            return Ok(cached);
        }

        let user = match fetch().await {
            Ok(user) => user,
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => {
                warn!(err = %e, "identity fetch failed, keeping cached identity");
                return Ok(cached);
            }
        };

        {
            let mut state = self.state.write();
            if !state.is_authenticated() {
                return Err(SessionError::NotAuthenticated);
            }
            let now = self.clock.now();
            if let Err(e) = self.persist_identity(&user, now) {
                warn!(err = %e, "refreshed identity kept in memory only");
            }
            state.identity = Some(user.clone());
            state.last_identity_fetch = Some(now);
        }
        debug!(username = %user.username, "identity refreshed");
        self.emit(SessionEvent::IdentityRefreshed { username: user.username.clone() });
        Ok(user)
    }

    /// Wipe memory and the durable mirror and disarm the scheduler. Returns
    /// whether a session was established.
    pub fn clear(&self, cause: ClearCause) -> bool {
        let was_authenticated = {
            let mut state = self.state.write();
            let was = state.is_authenticated();
            self.scheduler.disarm();
            self.wipe_mirror();
            *state = Session::default();
            was
        };
        if was_authenticated {
            info!(?cause, "session cleared");
            self.emit_cleared(cause);
        }
        was_authenticated
    }

    /// Like [`clear`](Self::clear), but only while `expected` is still the
    /// current pair. Returns whether it cleared.
    pub fn clear_if_current(&self, expected: &CredentialPair, cause: ClearCause) -> bool {
        {
            let mut state = self.state.write();
            if !state.is_authenticated() || state.credentials.as_ref() != Some(expected) {
                return false;
            }
            self.scheduler.disarm();
            self.wipe_mirror();
            *state = Session::default();
        }
        info!(?cause, "session cleared");
        self.emit_cleared(cause);
        true
    }

    /// Apply a sibling's logout. The sibling already wiped the mirror, so
    /// only memory and the scheduler are touched.
    pub fn apply_remote_logout(&self) -> bool {
        let was_authenticated = {
            let mut state = self.state.write();
            let was = state.is_authenticated();
            self.scheduler.disarm();
            *state = Session::default();
            was
        };
        if was_authenticated {
            info!("session cleared by sibling logout");
            self.emit_cleared(ClearCause::RemoteLogout);
        }
        was_authenticated
    }

    /// Re-read the mirror after a sibling changed it. Never writes the
    /// mirror, so nothing is echoed back.
    pub fn reload_from_mirror(&self) {
        let mirrored = self.read_mirror();
        if !mirrored.is_authenticated() {
            let was_authenticated = {
                let mut state = self.state.write();
                let was = state.is_authenticated();
                self.scheduler.disarm();
                *state = Session::default();
                was
            };
            if was_authenticated {
                info!("mirror empty after sibling change, session cleared");
                self.emit_cleared(ClearCause::RemoteCleared);
            }
            return;
        }

        let changed = {
            let mut state = self.state.write();
            let changed = *state != mirrored;
            if let Some(token) = mirrored.access_token() {
                self.scheduler.arm(token);
            }
            *state = mirrored;
            changed
        };
        if changed {
            debug!("session synced from mirror");
            self.emit(SessionEvent::Synced);
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_cleared(&self, cause: ClearCause) {
        self.emit(SessionEvent::Cleared { cause });
        if cause != ClearCause::Logout {
            let reason = match cause {
                ClearCause::AuthenticationFailed => "authentication failed",
                ClearCause::RemoteLogout => "logged out in another instance",
                ClearCause::RemoteCleared | ClearCause::Logout => "session ended",
            };
            self.emit(SessionEvent::LoginRequired { reason: reason.to_owned() });
        }
    }

    fn read_mirror(&self) -> Session {
        let credentials = self.read_key::<CredentialPair>(keys::CREDENTIALS);
        let identity = self.read_key::<User>(keys::IDENTITY);
        let last_identity_fetch = self.read_key::<u64>(keys::IDENTITY_FETCHED_AT).map(from_epoch_ms);
        Session { credentials, identity, last_identity_fetch }
    }

    fn read_key<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = match self.medium.get(key) {
            Ok(value) => value?,
            Err(e) => {
                warn!(key, err = %e, "failed to read durable mirror");
                return None;
            }
        };
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(key, err = %e, "ignoring unreadable mirror entry");
                None
            }
        }
    }

    fn write_key(&self, key: &str, value: Value) -> SessionResult<()> {
        self.medium
            .set(key, &value)
            .map_err(|e| SessionError::Storage(format!("write {key}: {e:#}")))
    }

    fn persist_credentials(&self, credentials: &CredentialPair) -> SessionResult<()> {
        let value = serde_json::to_value(credentials)
            .map_err(|e| SessionError::Storage(format!("encode credentials: {e}")))?;
        self.write_key(keys::CREDENTIALS, value)
    }

    fn persist_identity(&self, identity: &User, fetched_at: SystemTime) -> SessionResult<()> {
        let value = serde_json::to_value(identity)
            .map_err(|e| SessionError::Storage(format!("encode identity: {e}")))?;
        self.write_key(keys::IDENTITY, value)?;
        self.write_key(keys::IDENTITY_FETCHED_AT, Value::from(epoch_ms(fetched_at)))
    }

    fn wipe_mirror(&self) {
        for key in [keys::CREDENTIALS, keys::IDENTITY, keys::IDENTITY_FETCHED_AT] {
            if let Err(e) = self.medium.remove(key) {
                warn!(key, err = %e, "failed to remove durable mirror entry");
            }
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
