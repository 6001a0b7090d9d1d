// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the session lifecycle manager.
#[derive(Debug, Clone, clap::Args)]
pub struct SessionConfig {
    /// Base URL of the helpdesk API (identity endpoints live under it).
    #[arg(long, default_value = "http://127.0.0.1:8000/api", env = "DESK_API_URL")]
    pub api_url: String,

    /// Renew this many seconds before the access token expires.
    #[arg(long, default_value_t = 120, env = "DESK_REFRESH_LEAD_SECS")]
    pub lead_secs: u64,

    /// Reuse a fetched identity for this many seconds before refetching.
    #[arg(long, default_value_t = 300, env = "DESK_IDENTITY_STALE_SECS")]
    pub identity_stale_secs: u64,

    /// Timeout for every outbound request, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "DESK_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Timeout for the refresh exchange itself, in milliseconds.
    #[arg(long, default_value_t = 15_000, env = "DESK_REFRESH_TIMEOUT_MS")]
    pub refresh_timeout_ms: u64,

    /// Minimum spacing between back-to-back immediate proactive renewals
    /// (tokens whose whole lifetime fits inside the lead time).
    #[arg(long, default_value_t = 30_000, env = "DESK_MIN_RENEW_INTERVAL_MS")]
    pub min_renew_interval_ms: u64,

    /// Directory of the shared durable medium. Instances pointing at the same
    /// directory behave as tabs of one origin.
    #[arg(long, env = "DESK_STATE_DIR")]
    pub state_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000/api".to_owned(),
            lead_secs: 120,
            identity_stale_secs: 300,
            request_timeout_ms: 30_000,
            refresh_timeout_ms: 15_000,
            min_renew_interval_ms: 30_000,
            state_dir: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            anyhow::bail!("--api-url must be an http(s) URL, got {:?}", self.api_url);
        }
        if self.refresh_timeout_ms == 0 {
            anyhow::bail!("--refresh-timeout-ms must be greater than zero");
        }
        if self.refresh_timeout_ms > self.request_timeout_ms {
            anyhow::bail!("--refresh-timeout-ms cannot exceed --request-timeout-ms");
        }
        Ok(())
    }

    pub fn lead_time(&self) -> Duration {
        Duration::from_secs(self.lead_secs)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.identity_stale_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn min_renew_interval(&self) -> Duration {
        Duration::from_millis(self.min_renew_interval_ms)
    }

    /// Resolve the state directory.
    ///
    /// Checks `--state-dir`, then `$XDG_STATE_HOME/desk/session`,
    /// then `$HOME/.local/state/desk/session`.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.state_dir {
            return dir.clone();
        }
        if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
            return PathBuf::from(xdg).join("desk/session");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/state/desk/session");
        }
        PathBuf::from(".desk/session")
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
