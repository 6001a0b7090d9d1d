// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::*;

#[tokio::test]
async fn writes_are_visible_to_all_handles() -> anyhow::Result<()> {
    let hub = MemoryHub::new();
    let a = hub.attach();
    let b = hub.attach();

    a.set("k", &json!({"v": 1}))?;
    assert_eq!(b.get("k")?, Some(json!({"v": 1})));

    b.remove("k")?;
    assert_eq!(a.get("k")?, None);
    Ok(())
}

#[tokio::test]
async fn writer_does_not_observe_its_own_change() -> anyhow::Result<()> {
    let hub = MemoryHub::new();
    let a = hub.attach();
    let b = hub.attach();
    let mut a_rx = a.subscribe();
    let mut b_rx = b.subscribe();

    a.set("k", &json!(1))?;

    let change = b_rx.try_recv()?;
    assert_eq!(change, StorageChange { key: "k".into(), value: Some(json!(1)) });
    assert!(a_rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn remove_of_missing_key_is_silent() -> anyhow::Result<()> {
    let hub = MemoryHub::new();
    let a = hub.attach();
    let b = hub.attach();
    let mut b_rx = b.subscribe();

    a.remove("absent")?;
    assert!(b_rx.try_recv().is_err());
    Ok(())
}

#[test]
fn dropping_a_handle_detaches_it() {
    let hub = MemoryHub::new();
    let a = hub.attach();
    let b = hub.attach();
    assert_eq!(hub.attached(), 2);
    drop(b);
    assert_eq!(hub.attached(), 1);
    assert_ne!(a.origin(), "");
}
