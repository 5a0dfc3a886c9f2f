// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry budget and terminal-failure scenarios.

use crate::prelude::Harness;
use driftd_core::{ScanStatus, WorkerConfig};
use driftd_engine::RunResult;

#[tokio::test]
async fn failed_stack_retries_and_the_scan_completes() {
    let h = Harness::with_config(WorkerConfig {
        retry_once: true,
        ..WorkerConfig::default()
    });
    h.runner.push_result("envs/dev", RunResult::plan_error("boom"));
    // Second attempt is clean.

    let scan_id = h.trigger(&["envs/dev"]).await;

    // First attempt fails; the item goes back to the queue.
    h.drain(1).await;
    let scan = h.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Running);
    assert_eq!(scan.queued, 1);
    assert_eq!(scan.running, 0);

    // Second attempt completes the scan with no recorded failure.
    h.drain(1).await;
    let scan = h.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.completed, 1);
    assert_eq!(scan.failed, 0);
    assert_eq!(h.runner.calls().len(), 2);
}

#[tokio::test]
async fn all_stacks_failing_fails_the_scan() {
    let h = Harness::new();
    h.runner.push_result("envs/dev", RunResult::plan_error("bad plan"));
    h.runner
        .push_result("envs/prod", RunResult::plan_error("worse plan"));

    let scan_id = h.trigger(&["envs/dev", "envs/prod"]).await;
    h.drain(2).await;

    let scan = h.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Failed);
    assert_eq!(scan.failed, 2);
    assert_eq!(scan.errored, 2);
    assert_eq!(scan.completed, 0);
    assert!(scan.ended_at > 0);
}

#[tokio::test]
async fn mixed_outcomes_still_finish_failed() {
    let h = Harness::new();
    h.runner.push_result("envs/dev", RunResult::plan_error("boom"));

    let scan_id = h.trigger(&["envs/dev", "envs/prod"]).await;
    h.drain(2).await;

    let scan = h.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Failed);
    assert_eq!(scan.completed, 1);
    assert_eq!(scan.failed, 1);
}
