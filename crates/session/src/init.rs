// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot latch for the bootstrap sequence.
///
/// The first [`try_enter`](Self::try_enter) wins; every later call, including
/// concurrent ones, returns `false` without waiting.
#[derive(Debug, Default)]
pub struct InitGuard {
    started: AtomicBool,
}

impl InitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self) -> bool {
        self.started.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn has_run(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}
