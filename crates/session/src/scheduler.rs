// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Proactive renewal timer.
//!
//! At most one timer is pending per process. Arming always cancels the
//! previous timer first; every arm/disarm bumps a generation so a timer that
//! wakes after being superseded does nothing.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::token;

/// Callback invoked when renewal is due. Implementations must not block;
/// they spawn the renewal.
pub type RenewalTrigger = Box<dyn Fn() + Send + Sync>;

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Idle,
    Armed { fire_at: SystemTime, delay: Duration },
}

/// Result of [`RefreshScheduler::arm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    /// Timer pending for this long.
    Scheduled(Duration),
    /// Token was expired or inside the lead window; renewal fired at once.
    FiredNow,
    /// Token expiry unknown; renewal is left to the reactive path.
    Unscheduled,
}

struct Armed {
    fire_at: SystemTime,
    delay: Duration,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
    generation: u64,
    armed: Option<Armed>,
    /// When the last immediate (zero-delay) renewal fired.
    last_immediate: Option<SystemTime>,
}

pub struct RefreshScheduler {
    lead: Duration,
    min_interval: Duration,
    clock: SharedClock,
    state: Arc<Mutex<SchedulerState>>,
    trigger: Arc<OnceLock<RenewalTrigger>>,
}

impl RefreshScheduler {
    pub fn new(lead: Duration, min_interval: Duration, clock: SharedClock) -> Self {
        Self {
            lead,
            min_interval,
            clock,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            trigger: Arc::new(OnceLock::new()),
        }
    }

    /// Install the renewal callback. Only the first call takes effect.
    pub fn set_trigger(&self, trigger: RenewalTrigger) {
        if self.trigger.set(trigger).is_err() {
            warn!("renewal trigger already installed, ignoring");
        }
    }

    pub fn lead(&self) -> Duration {
        self.lead
    }

    pub fn status(&self) -> SchedulerStatus {
        match self.state.lock().armed {
            Some(ref armed) => SchedulerStatus::Armed { fire_at: armed.fire_at, delay: armed.delay },
            None => SchedulerStatus::Idle,
        }
    }

    /// Arm against `access_token`, replacing any pending timer.
    pub fn arm(&self, access_token: &str) -> ArmOutcome {
        let now = self.clock.now();
        let mut state = self.state.lock();
        Self::cancel_locked(&mut state);

        let Some(target) = token::lead_refresh_instant(access_token, self.lead, now) else {
            debug!("access token has no readable expiry, proactive renewal disabled");
            return ArmOutcome::Unscheduled;
        };

        let mut delay = target.duration_since(now).unwrap_or_default();
        if delay.is_zero() {
            // A token whose lifetime fits inside the lead window would
            // otherwise renew in a tight loop.
            let recent = state
                .last_immediate
                .and_then(|at| now.duration_since(at).ok())
                .filter(|since| *since < self.min_interval);
            match recent {
                Some(since) => delay = self.min_interval - since,
                None => {
                    state.last_immediate = Some(now);
                    drop(state);
                    debug!("access token inside lead window, renewing now");
                    self.fire();
                    return ArmOutcome::FiredNow;
                }
            }
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, cannot arm refresh timer");
            return ArmOutcome::Unscheduled;
        };

        let cancel = CancellationToken::new();
        let generation = state.generation;
        state.armed = Some(Armed { fire_at: now + delay, delay, cancel: cancel.clone() });
        drop(state);

        let shared = Arc::clone(&self.state);
        let trigger = Arc::clone(&self.trigger);
        runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
            {
                let mut state = shared.lock();
                if state.generation != generation {
                    return;
                }
                state.armed = None;
            }
            debug!("refresh timer fired");
            if let Some(trigger) = trigger.get() {
                trigger();
            }
        });

        debug!(delay_secs = delay.as_secs(), "refresh timer armed");
        ArmOutcome::Scheduled(delay)
    }

    /// Cancel any pending timer.
    pub fn disarm(&self) {
        let mut state = self.state.lock();
        let was_armed = state.armed.is_some();
        Self::cancel_locked(&mut state);
        state.last_immediate = None;
        if was_armed {
            debug!("refresh timer disarmed");
        }
    }

    fn cancel_locked(state: &mut SchedulerState) {
        state.generation = state.generation.wrapping_add(1);
        if let Some(armed) = state.armed.take() {
            armed.cancel.cancel();
        }
    }

    fn fire(&self) {
        match self.trigger.get() {
            Some(trigger) => trigger(),
            None => debug!("no renewal trigger installed"),
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        Self::cancel_locked(&mut self.state.lock());
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
