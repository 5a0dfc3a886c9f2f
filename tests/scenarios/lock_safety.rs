// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lock safety under TTL lapse: a scan that lost its lock can fail itself
//! without touching the successor's lock or pointers.

use crate::prelude::Harness;
use driftd_core::ScanStatus;
use driftd_kv::KvDriver;
use driftd_store::keys;

#[tokio::test]
async fn lapsed_scan_cannot_disturb_its_successor() {
    let h = Harness::new();

    // Scan A holds the lock.
    let a = h.trigger(&["envs/dev"]).await;

    // The lock key expires (simulated by deleting it directly), and scan B
    // starts in its place.
    h.kv.force_del(&keys::project_lock("p"));
    h.kv.force_del(&keys::active_scan("p"));
    let b = h.trigger(&["envs/prod"]).await;

    // Now A is failed (by an operator or stale recovery).
    h.scans.fail(&a, "lost lock").await.unwrap();

    // B's lock and active pointer are intact.
    assert_eq!(
        h.kv.get(&keys::project_lock("p")).await.unwrap(),
        Some(b.to_string())
    );
    assert_eq!(
        h.kv.get(&keys::active_scan("p")).await.unwrap(),
        Some(b.to_string())
    );

    let failed = h.scans.get(&a).await.unwrap();
    assert_eq!(failed.status, ScanStatus::Failed);
    assert!(failed.ended_at > 0);

    // B still finishes normally.
    h.drain(2).await;
    let done = h.scans.get(&b).await.unwrap();
    assert_eq!(done.status, ScanStatus::Completed);
}

#[tokio::test]
async fn concurrent_start_loses_to_the_lock() {
    let h = Harness::new();

    h.trigger(&["envs/dev"]).await;

    // With supersede disabled at the store level, a plain start must fail.
    let err = h
        .scans
        .start(driftd_core::scan::ScanConfig {
            project: "p".to_string(),
            total: 1,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, driftd_store::StoreError::ProjectLocked(_)));
}
