// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authenticated request path with single-flight renewal.
//!
//! Every outbound call goes through [`AuthClient::execute`]. An authorization
//! failure on a non-auth endpoint routes into [`AuthClient::renew`], the one
//! renewal function shared by the reactive path and the proactive timer. The
//! first caller to find no renewal in flight spawns the exchange; everyone
//! else queues a oneshot. The queue is drained under the same lock that
//! clears the in-flight flag.
//!
//! Siblings renewing the same token coordinate through a lease in the shared
//! medium: one exchanges, the rest adopt its result from the mirror. The
//! store only accepts a renewed pair while the pair it was minted from is
//! still current.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::broadcast::CrossTabBroadcaster;
use crate::error::{SessionError, SessionResult};
use crate::event::ClearCause;
use crate::identity::{
    self, ApiResponse, AuthResponse, CredentialPair, Endpoint, IdentityClient, LoginRequest,
    RegisterRequest, User,
};
use crate::scheduler::RenewalTrigger;
use crate::store::{CredentialUpdate, SessionStore};

type Waiter = oneshot::Sender<SessionResult<()>>;

#[derive(Default)]
struct RenewalState {
    in_flight: bool,
    waiters: Vec<Waiter>,
}

pub struct AuthClient {
    api: IdentityClient,
    store: Arc<SessionStore>,
    broadcaster: Arc<CrossTabBroadcaster>,
    refresh_timeout: Duration,
    renewal: Mutex<RenewalState>,
}

impl AuthClient {
    pub fn new(
        api: IdentityClient,
        store: Arc<SessionStore>,
        broadcaster: Arc<CrossTabBroadcaster>,
        refresh_timeout: Duration,
    ) -> Self {
        Self { api, store, broadcaster, refresh_timeout, renewal: Mutex::new(RenewalState::default()) }
    }

    pub fn api(&self) -> &IdentityClient {
        &self.api
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Current bearer credential, if a session is established.
    pub fn bearer(&self) -> Option<String> {
        self.store.access_token()
    }

    /// Whether a renewal exchange is currently outstanding.
    pub fn renewal_in_flight(&self) -> bool {
        self.renewal.lock().in_flight
    }

    /// Scheduler callback that spawns a proactive renewal. Holds only a weak
    /// reference, so the scheduler never keeps the client alive.
    pub fn proactive_trigger(self: &Arc<Self>) -> RenewalTrigger {
        let weak = Arc::downgrade(self);
        Box::new(move || {
            let Some(client) = weak.upgrade() else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { client.renew_proactive().await });
                }
                Err(_) => warn!("no async runtime, skipping proactive renewal"),
            }
        })
    }

    /// Send a request built by `build`, recovering once from an authorization
    /// failure. `build` may be called twice (original and replay).
    pub async fn execute<F>(self: &Arc<Self>, endpoint: Endpoint, build: F) -> SessionResult<ApiResponse>
    where
        F: Fn(&IdentityClient) -> reqwest::RequestBuilder,
    {
        let sent_with = if endpoint.attaches_bearer() {
            Some(self.store.access_token().ok_or(SessionError::NotAuthenticated)?)
        } else {
            None
        };

        let resp = self.send_once(&build, sent_with.as_deref()).await?;
        if !resp.is_authorization_failure() {
            return Ok(resp);
        }

        if endpoint.is_auth_endpoint() {
            debug!(?endpoint, status = resp.status, "auth endpoint rejected, not retrying");
            return Err(self.terminate(format!("{endpoint:?} rejected ({})", resp.status)));
        }

        // Skip the exchange if someone renewed while this request was out.
        let current = self.store.access_token();
        if current.is_none() {
            return Err(SessionError::AuthenticationFailed("session ended".into()));
        }
        if current == sent_with {
            debug!(?endpoint, status = resp.status, "authorization failure, renewing");
            self.renew().await?;
        }

        let token = self
            .store
            .access_token()
            .ok_or_else(|| SessionError::AuthenticationFailed("session ended".into()))?;
        let replay = self.send_once(&build, Some(&token)).await?;
        if replay.is_authorization_failure() {
            warn!(?endpoint, status = replay.status, "request rejected after renewal");
            return Err(self.terminate(format!("{endpoint:?} rejected after renewal")));
        }
        Ok(replay)
    }

    async fn send_once<F>(&self, build: &F, bearer: Option<&str>) -> SessionResult<ApiResponse>
    where
        F: Fn(&IdentityClient) -> reqwest::RequestBuilder,
    {
        let mut req = build(&self.api);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        identity::send(req).await
    }

    /// Renew the access token, joining an in-flight renewal if there is one.
    /// Every caller queued behind one exchange receives the same result.
    pub async fn renew(self: &Arc<Self>) -> SessionResult<()> {
        let rx = {
            let mut state = self.renewal.lock();
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            if !state.in_flight {
                state.in_flight = true;
                // Detached so a cancelled caller cannot strand the queue.
                let this = Arc::clone(self);
                tokio::spawn(async move { this.drive_renewal().await });
            }
            rx
        };
        rx.await
            .unwrap_or_else(|_| Err(SessionError::AuthenticationFailed("renewal abandoned".into())))
    }

    /// Timer entry point. A stale timer after logout is a no-op.
    pub async fn renew_proactive(self: &Arc<Self>) {
        if !self.store.is_authenticated() {
            debug!("proactive renewal skipped, no session");
            return;
        }
        match self.renew().await {
            Ok(()) => debug!("proactive renewal complete"),
            Err(e) => warn!(err = %e, "proactive renewal failed"),
        }
    }

    async fn drive_renewal(self: Arc<Self>) {
        let outcome = match self.store.credentials() {
            Some(started) => self.renew_from(started).await,
            None => Err(SessionError::AuthenticationFailed("session ended".into())),
        };

        let mut state = self.renewal.lock();
        let waiters = std::mem::take(&mut state.waiters);
        debug!(waiters = waiters.len(), "draining renewal queue");
        for waiter in waiters {
            // A dropped receiver just means that caller went away.
            let _ = waiter.send(outcome.clone());
        }
        state.in_flight = false;
    }

    async fn renew_from(&self, started: CredentialPair) -> SessionResult<()> {
        let result = self.exchange(&started).await;
        self.broadcaster.release_renewal();
        let Err(e) = result else {
            info!("access token renewed");
            return Ok(());
        };

        if self.store.clear_if_current(&started, ClearCause::AuthenticationFailed) {
            warn!(err = %e, "renewal failed, ending session");
            self.broadcaster.broadcast_logout();
            return Err(as_authentication_failure(e));
        }
        if self.store.is_authenticated() {
            // Logged in again (or a sibling renewed) while this exchange ran.
            debug!(err = %e, "renewal failed for a superseded session");
            return Ok(());
        }
        Err(as_authentication_failure(e))
    }

    /// One refresh exchange: no retries, bounded by the refresh timeout.
    /// Skipped when a sibling already renewed `started`.
    async fn exchange(&self, started: &CredentialPair) -> SessionResult<()> {
        if let Some(settled) = self.settled_elsewhere(started) {
            return settled;
        }
        if !self.broadcaster.try_claim_renewal(self.refresh_timeout) {
            self.await_sibling_renewal(started).await;
            if let Some(settled) = self.settled_elsewhere(started) {
                return settled;
            }
            debug!("sibling renewal did not land, renewing here");
        }

        let (access_token, rotated) =
            tokio::time::timeout(self.refresh_timeout, self.api.refresh(&started.refresh_token))
                .await
                .map_err(|_| {
                    SessionError::RefreshFailed(format!(
                        "no response within {}ms",
                        self.refresh_timeout.as_millis()
                    ))
                })??;

        let credentials = CredentialPair {
            access_token,
            refresh_token: rotated.unwrap_or_else(|| started.refresh_token.clone()),
        };
        match self.store.update(started, credentials) {
            CredentialUpdate::Applied => {
                self.broadcaster.broadcast_session_change();
                Ok(())
            }
            CredentialUpdate::Superseded => Ok(()),
            CredentialUpdate::Ended => {
                Err(SessionError::AuthenticationFailed("session ended during renewal".into()))
            }
        }
    }

    /// Outcome of renewing `started` if it no longer needs this instance's
    /// exchange: the session moved on, ended, or a sibling's renewal is
    /// waiting in the mirror.
    fn settled_elsewhere(&self, started: &CredentialPair) -> Option<SessionResult<()>> {
        match self.store.credentials() {
            None => Some(Err(SessionError::AuthenticationFailed(
                "session ended during renewal".into(),
            ))),
            Some(current) if current != *started => Some(Ok(())),
            Some(_) if self.store.adopt_sibling_renewal(started) => Some(Ok(())),
            Some(_) => None,
        }
    }

    /// Wait (at most one refresh timeout) for the lease holder's result to
    /// reach this instance's store.
    async fn await_sibling_renewal(&self, started: &CredentialPair) {
        debug!("waiting for sibling renewal");
        let mut events = self.store.subscribe();
        let moved_on = || self.store.credentials().as_ref() != Some(started);
        let _ = tokio::time::timeout(self.refresh_timeout, async {
            while !moved_on() {
                match events.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
        .await;
    }

    /// Tear down the session after exhausted recovery and tell siblings.
    fn terminate(&self, reason: String) -> SessionError {
        if self.store.clear(ClearCause::AuthenticationFailed) {
            self.broadcaster.broadcast_logout();
        }
        SessionError::AuthenticationFailed(reason)
    }

    pub async fn login(self: &Arc<Self>, username: &str, password: &str) -> SessionResult<User> {
        let body = LoginRequest { username: username.to_owned(), password: password.to_owned() };
        let resp = self.execute(Endpoint::Login, |api| api.login_request(&body)).await?;
        self.establish_from(resp)
    }

    pub async fn register(self: &Arc<Self>, request: &RegisterRequest) -> SessionResult<User> {
        let resp = self.execute(Endpoint::Register, |api| api.register_request(request)).await?;
        self.establish_from(resp)
    }

    fn establish_from(&self, resp: ApiResponse) -> SessionResult<User> {
        let (credentials, user) = resp.error_for_status()?.json::<AuthResponse>()?.into_parts();
        self.store.establish(credentials, user.clone())?;
        self.broadcaster.broadcast_session_change();
        Ok(user)
    }

    /// End the session here and in every sibling. The server call is best
    /// effort; local state is cleared regardless of its outcome.
    pub async fn logout(&self) {
        if let Some(token) = self.store.access_token() {
            match identity::send(self.api.logout_request().bearer_auth(token)).await {
                Ok(resp) if !resp.is_success() => {
                    debug!(status = resp.status, "server logout returned non-success");
                }
                Ok(_) => {}
                Err(e) => warn!(err = %e, "server logout failed"),
            }
        }
        self.store.clear(ClearCause::Logout);
        self.broadcaster.broadcast_logout();
    }

    /// `GET /me` through the recovery path.
    pub async fn fetch_me(self: &Arc<Self>) -> SessionResult<User> {
        let resp = match self.execute(Endpoint::Me, |api| api.me_request()).await {
            Ok(resp) => resp,
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => return Err(SessionError::IdentityFetchFailed(e.to_string())),
        };
        if !resp.is_success() {
            return Err(SessionError::IdentityFetchFailed(format!(
                "status {}: {}",
                resp.status,
                resp.text()
            )));
        }
        resp.json::<User>().map_err(|e| SessionError::IdentityFetchFailed(e.to_string()))
    }

    /// Refetch identity if the cache is stale.
    pub async fn refresh_identity(self: &Arc<Self>) -> SessionResult<User> {
        self.store.refresh_identity(|| self.fetch_me()).await
    }

    /// `GET {path}` decoded as JSON. Convenience for resource consumers.
    pub async fn get_json<T: DeserializeOwned>(self: &Arc<Self>, path: &str) -> SessionResult<T> {
        let resp = self.execute(Endpoint::Resource, |api| api.http().get(api.url(path))).await?;
        resp.error_for_status()?.json()
    }

    /// Send `body` as JSON with `method` to `path` and decode the reply.
    pub async fn send_json<B, T>(
        self: &Arc<Self>,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> SessionResult<T>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self
            .execute(Endpoint::Resource, |api| {
                api.http().request(method.clone(), api.url(path)).json(body)
            })
            .await?;
        resp.error_for_status()?.json()
    }
}

fn as_authentication_failure(e: SessionError) -> SessionError {
    match e {
        SessionError::AuthenticationFailed(_) => e,
        other => SessionError::AuthenticationFailed(other.to_string()),
    }
}

#[cfg(test)]
#[path = "interceptor_tests.rs"]
mod tests;
