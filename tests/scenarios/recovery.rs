// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stale and orphan recovery scenarios.

use crate::prelude::{Harness, DEQ};
use driftd_core::stack_scan::StackScanStatus;
use driftd_core::ScanStatus;
use driftd_engine::{recover_once, RecoverySettings};
use driftd_kv::KvDriver;
use driftd_store::keys;
use std::time::Duration;

const SETTINGS: RecoverySettings = RecoverySettings {
    interval: Duration::from_secs(60),
    orphan_grace: Duration::from_secs(60),
    stack_max_age: Duration::from_secs(30 * 60),
    scan_max_age: Duration::from_secs(60 * 60),
};

#[tokio::test]
async fn stale_scan_recovery_fails_the_scan_and_clears_the_index() {
    let h = Harness::new();

    // A scan that has been "running" for two hours.
    let scan_id = h.trigger(&["envs/dev"]).await;
    h.clock.advance_ms(2 * 60 * 60 * 1000);

    let report = recover_once(&h.queue, &h.scans, &SETTINGS).await.unwrap();
    assert_eq!(report.stale_scans, 1);

    let scan = h.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Failed);
    assert_eq!(scan.error, "exceeded maximum duration");
    assert!(scan.ended_at > 0);
    assert_eq!(h.kv.zcard(keys::RUNNING_SCANS).await.unwrap(), 0);
}

#[tokio::test]
async fn stale_stack_scan_recovery_fails_lost_work() {
    let h = Harness::new();

    let scan_id = h.trigger(&["envs/dev"]).await;
    // A worker claimed the item and vanished.
    h.queue.dequeue(&h.worker, DEQ).await.unwrap().unwrap();
    h.clock.advance_ms(60 * 60 * 1000);

    let report = recover_once(&h.queue, &h.scans, &SETTINGS).await.unwrap();
    assert_eq!(report.stale_stack_scans, 1);

    // With no retry budget the item fails terminally, which also finishes
    // the scan (its only stack resolved).
    let items = h.queue.project_items("p", 0).await.unwrap();
    assert_eq!(items[0].status, StackScanStatus::Failed);
    let scan = h.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Failed);
    assert_eq!(scan.errored, 1);
}

#[tokio::test]
async fn orphaned_pending_items_get_requeued_and_processed() {
    let h = Harness::new();

    let scan_id = h.trigger(&["envs/dev"]).await;
    // The id fell out of the queue list without being claimed (consumer
    // crashed between pop and claim).
    h.kv.brpop(keys::QUEUE_WORKITEMS, Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.queue.depth().await.unwrap(), 0);

    // Past the orphan grace the item is recoverable.
    h.clock.advance_ms(2 * 60 * 1000);
    let report = recover_once(&h.queue, &h.scans, &SETTINGS).await.unwrap();
    assert_eq!(report.orphans_requeued, 1);

    h.drain(1).await;
    let scan = h.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.completed, 1);
}

#[tokio::test]
async fn recovery_is_a_noop_on_a_healthy_system() {
    let h = Harness::new();

    let scan_id = h.trigger(&["envs/dev"]).await;
    let report = recover_once(&h.queue, &h.scans, &SETTINGS).await.unwrap();
    assert_eq!(report, Default::default());

    h.drain(1).await;
    let report = recover_once(&h.queue, &h.scans, &SETTINGS).await.unwrap();
    assert_eq!(report, Default::default());
    assert_eq!(
        h.scans.get(&scan_id).await.unwrap().status,
        ScanStatus::Completed
    );
}
