// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod init;
pub mod interceptor;
pub mod manager;
pub mod medium;
pub mod scheduler;
pub mod store;
#[cfg(test)]
pub mod test_support;
pub mod token;

pub use error::{SessionError, SessionResult};
pub use manager::{BootstrapOutcome, SessionManager};
