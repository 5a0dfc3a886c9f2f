// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-stack happy path and the zero-stack degenerate case.

use crate::prelude::Harness;
use driftd_core::ScanStatus;
use driftd_engine::RunResult;
use driftd_kv::KvDriver;
use driftd_store::keys;

#[tokio::test]
async fn single_stack_scan_completes_with_drift() {
    let h = Harness::new();
    h.runner
        .push_result("envs/dev", RunResult::with_drift(3, 1, 0));

    let scan_id = h.trigger(&["envs/dev"]).await;
    h.drain(1).await;

    let scan = h.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.completed, 1);
    assert_eq!(scan.failed, 0);
    assert_eq!(scan.drifted, 1);
    assert!(scan.ended_at > 0);

    // Lock released, last-scan pointer set, no active scan.
    assert!(!h.kv.exists(&keys::project_lock("p")).await.unwrap());
    assert_eq!(
        h.kv.get(&keys::last_scan("p")).await.unwrap(),
        Some(scan_id.to_string())
    );
    assert!(h.scans.active("p").await.unwrap().is_none());

    // The queue is drained and the stack can go again.
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert!(!h.kv.exists(&keys::inflight("p", "envs/dev")).await.unwrap());
}

#[tokio::test]
async fn zero_stack_scan_fails_immediately() {
    let h = Harness::new();

    let scan_id = h.trigger(&[]).await;

    let scan = h.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Failed);
    assert_eq!(scan.failed, 1);
    assert!(scan.ended_at > 0);
    assert!(!h.kv.exists(&keys::project_lock("p")).await.unwrap());
    // No plan ever ran.
    assert!(h.runner.calls().is_empty());
}

#[tokio::test]
async fn multi_stack_scan_aggregates_drift() {
    let h = Harness::new();
    h.runner
        .push_result("envs/dev", RunResult::with_drift(1, 0, 0));
    // envs/prod and envs/stage stay clean (unscripted).

    let scan_id = h.trigger(&["envs/dev", "envs/prod", "envs/stage"]).await;
    h.drain(3).await;

    let scan = h.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.completed, 3);
    assert_eq!(scan.drifted, 1);
    assert_eq!(scan.queued, 0);
    assert_eq!(scan.running, 0);
    assert_eq!(h.runner.calls().len(), 3);
}
