// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session manager: wires the store, scheduler, broadcaster and
//! authenticated client for one instance and owns their background tasks.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::CrossTabBroadcaster;
use crate::clock::{system_clock, SharedClock};
use crate::config::SessionConfig;
use crate::error::SessionResult;
use crate::event::SessionEvent;
use crate::identity::{IdentityClient, RegisterRequest, User};
use crate::init::InitGuard;
use crate::interceptor::AuthClient;
use crate::medium::file::FileMedium;
use crate::medium::SharedMediumRef;
use crate::scheduler::RefreshScheduler;
use crate::store::{Session, SessionStore};
use crate::token;

/// Result of [`SessionManager::bootstrap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// A persisted session was restored and is usable.
    Restored(User),
    /// Nothing usable was persisted; the host should show its login screen.
    Anonymous,
    /// Bootstrap already ran in this process; nothing was done.
    AlreadyRan,
}

pub struct SessionManager {
    clock: SharedClock,
    store: Arc<SessionStore>,
    client: Arc<AuthClient>,
    init: InitGuard,
    shutdown: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Assemble a manager over `medium`. Must be called inside a Tokio
    /// runtime: the sibling listener starts immediately.
    pub fn new(
        config: &SessionConfig,
        medium: SharedMediumRef,
        clock: SharedClock,
    ) -> SessionResult<Self> {
        Self::assemble(config, medium, clock, CancellationToken::new())
    }

    /// Open the file-backed medium under the configured state directory.
    pub fn open(config: &SessionConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let dir = config.state_dir();
        let medium = FileMedium::open(&dir, shutdown.child_token())?;
        Ok(Self::assemble(config, medium, system_clock(), shutdown)?)
    }

    fn assemble(
        config: &SessionConfig,
        medium: SharedMediumRef,
        clock: SharedClock,
        shutdown: CancellationToken,
    ) -> SessionResult<Self> {
        let api = IdentityClient::new(&config.api_url, config.request_timeout())?;
        let scheduler = Arc::new(RefreshScheduler::new(
            config.lead_time(),
            config.min_renew_interval(),
            Arc::clone(&clock),
        ));
        let store = Arc::new(SessionStore::new(
            Arc::clone(&medium),
            Arc::clone(&scheduler),
            Arc::clone(&clock),
            config.staleness_window(),
        ));
        let broadcaster =
            Arc::new(CrossTabBroadcaster::new(medium, Arc::clone(&store), Arc::clone(&clock)));
        let client = Arc::new(AuthClient::new(
            api,
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            config.refresh_timeout(),
        ));
        scheduler.set_trigger(client.proactive_trigger());
        let listener = broadcaster.spawn_listener(shutdown.child_token());

        Ok(Self {
            clock,
            store,
            client,
            init: InitGuard::new(),
            shutdown,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Restore the persisted session, renew it if its access token already
    /// expired, arm the scheduler and refetch a stale identity. Runs once per
    /// manager; later calls return [`BootstrapOutcome::AlreadyRan`].
    pub async fn bootstrap(&self) -> SessionResult<BootstrapOutcome> {
        if !self.init.try_enter() {
            debug!("bootstrap already ran, skipping");
            return Ok(BootstrapOutcome::AlreadyRan);
        }

        let restored = self.store.restore();
        let Some(access) = restored.access_token() else {
            info!("no persisted session");
            return Ok(BootstrapOutcome::Anonymous);
        };

        if token::is_expired(access, self.clock.now()) {
            debug!("persisted access token expired, renewing");
            if let Err(e) = self.client.renew().await {
                warn!(err = %e, "could not renew persisted session");
                return Ok(BootstrapOutcome::Anonymous);
            }
        } else {
            self.store.rearm();
        }

        match self.client.refresh_identity().await {
            Ok(user) => Ok(BootstrapOutcome::Restored(user)),
            Err(e) if e.is_terminal() => {
                warn!(err = %e, "persisted session rejected");
                Ok(BootstrapOutcome::Anonymous)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> SessionResult<User> {
        self.client.login(username, password).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> SessionResult<User> {
        self.client.register(request).await
    }

    pub async fn logout(&self) {
        self.client.logout().await;
    }

    /// Authenticated client for resource consumers.
    pub fn client(&self) -> Arc<AuthClient> {
        Arc::clone(&self.client)
    }

    pub fn bearer(&self) -> Option<String> {
        self.client.bearer()
    }

    pub fn snapshot(&self) -> Session {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.store.subscribe()
    }

    pub async fn refresh_identity(&self) -> SessionResult<User> {
        self.client.refresh_identity().await
    }

    /// Disarm the scheduler and stop background tasks. The session itself
    /// stays persisted for the next start.
    pub async fn shutdown(&self) {
        self.store.scheduler().disarm();
        self.shutdown.cancel();
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                warn!(err = %e, "broadcast listener ended abnormally");
            }
        }
        debug!("session manager shut down");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
