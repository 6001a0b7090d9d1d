// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process medium. One [`MemoryHub`] plays the role of the origin's
//! storage; each [`MemoryMedium`] attached to it is one instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use super::{SharedMedium, StorageChange, CHANGE_CHANNEL_CAPACITY};

#[derive(Default)]
struct HubInner {
    values: RwLock<HashMap<String, serde_json::Value>>,
    /// Change senders of attached handles, keyed by origin.
    listeners: Mutex<Vec<(String, broadcast::Sender<StorageChange>)>>,
}

/// Shared backing store for in-process instances.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new instance with a fresh origin id.
    pub fn attach(&self) -> Arc<MemoryMedium> {
        let origin = uuid::Uuid::new_v4().to_string();
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        self.inner.listeners.lock().push((origin.clone(), tx.clone()));
        Arc::new(MemoryMedium { hub: Arc::clone(&self.inner), origin, tx })
    }

    /// Number of attached handles.
    pub fn attached(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

/// One instance's handle on a [`MemoryHub`].
pub struct MemoryMedium {
    hub: Arc<HubInner>,
    origin: String,
    tx: broadcast::Sender<StorageChange>,
}

impl MemoryMedium {
    fn notify_others(&self, change: StorageChange) {
        let listeners = self.hub.listeners.lock();
        for (origin, tx) in listeners.iter() {
            if *origin == self.origin {
                continue;
            }
            // No receivers yet is fine; the instance has not subscribed.
            let _ = tx.send(change.clone());
        }
    }
}

impl SharedMedium for MemoryMedium {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(self.hub.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        self.hub.values.write().insert(key.to_owned(), value.clone());
        self.notify_others(StorageChange { key: key.to_owned(), value: Some(value.clone()) });
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let existed = self.hub.values.write().remove(key).is_some();
        if existed {
            self.notify_others(StorageChange { key: key.to_owned(), value: None });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.tx.subscribe()
    }
}

impl Drop for MemoryMedium {
    fn drop(&mut self) {
        self.hub.listeners.lock().retain(|(origin, _)| *origin != self.origin);
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
