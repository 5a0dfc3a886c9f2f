// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cancel cascade: in-flight plans abort via the watchdog, pending items
//! observe the canceled parent before running.

use crate::prelude::{Harness, DEQ};
use driftd_core::stack_scan::StackScanStatus;
use driftd_core::{ScanStatus, TriggerKind};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn cancel_cascades_to_inflight_and_pending_items() {
    let h = Harness::new();
    // Plans hang long enough for the cancel to land mid-run.
    h.runner.set_delay(Duration::from_secs(600));

    let scan_id = h.trigger(&["envs/dev", "envs/prod", "envs/stage"]).await;

    // One worker picks up the first item and blocks in the plan.
    let inflight = {
        let pool = h.pool.clone();
        let worker = h.worker.clone();
        tokio::spawn(async move { pool.process_one(&worker, DEQ).await })
    };
    tokio::time::sleep(Duration::from_secs(2)).await;

    h.dispatcher.cancel_active("p", "user").await.unwrap();

    // The watchdog polls every ~3 s, so the in-flight plan aborts within
    // 3-6 s of the cancel.
    inflight.await.unwrap().unwrap();

    // The remaining pending items observe the canceled parent and never run.
    h.drain(2).await;

    let scan = h.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Canceled);
    assert_eq!(scan.error, "user");

    let items = h.queue.project_items("p", 0).await.unwrap();
    assert_eq!(items.len(), 3);
    for item in &items {
        assert_eq!(item.status, StackScanStatus::Canceled, "{}", item.stack_path);
    }
    // Only the first item ever invoked the runner.
    assert_eq!(h.runner.calls().len(), 1);
}

#[tokio::test]
async fn new_trigger_supersedes_and_old_children_cancel() {
    let h = Harness::new();

    let first = h.trigger_kind(TriggerKind::Scheduled, &["envs/dev"]).await;
    let second = h.trigger_kind(TriggerKind::Manual, &["envs/prod"]).await;

    let old = h.scans.get(&first).await.unwrap();
    assert_eq!(old.status, ScanStatus::Canceled);

    // envs/dev's pending item (child of the canceled scan) cancels at
    // dequeue; envs/prod completes under the new scan.
    h.drain(2).await;

    let new = h.scans.get(&second).await.unwrap();
    assert_eq!(new.status, ScanStatus::Completed);
    assert_eq!(new.completed, 1);

    let items = h.queue.project_items("p", 0).await.unwrap();
    let dev = items
        .iter()
        .find(|item| item.stack_path == "envs/dev")
        .unwrap();
    assert_eq!(dev.status, StackScanStatus::Canceled);
}
