// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use driftd_core::{FakeClock, TriggerKind};
use driftd_kv::MemoryDriver;

const LOCK_TTL: Duration = Duration::from_secs(300);

fn store(kv: MemoryDriver, clock: FakeClock) -> Scans<MemoryDriver, FakeClock> {
    Scans::new(kv, clock, LOCK_TTL)
}

fn config(project: &str, total: i64) -> ScanConfig {
    ScanConfig {
        project: project.to_string(),
        trigger: Some(TriggerKind::Manual),
        total,
        ..ScanConfig::default()
    }
}

#[tokio::test]
async fn start_writes_hash_lock_pointer_and_index() {
    let kv = MemoryDriver::new();
    let clock = FakeClock::at(1_000);
    let scans = store(kv.clone(), clock);

    let scan = scans.start(config("p", 2)).await.unwrap();

    assert_eq!(scan.status, ScanStatus::Running);
    assert_eq!(scan.queued, 2);

    let fetched = scans.get(&scan.id).await.unwrap();
    assert_eq!(fetched, scan);

    assert_eq!(
        kv.get(&keys::project_lock("p")).await.unwrap(),
        Some(scan.id.to_string())
    );
    assert_eq!(
        kv.get(&keys::active_scan("p")).await.unwrap(),
        Some(scan.id.to_string())
    );
    assert_eq!(kv.zcard(keys::RUNNING_SCANS).await.unwrap(), 1);
}

#[tokio::test]
async fn only_one_scan_runs_per_project() {
    let kv = MemoryDriver::new();
    let scans = store(kv, FakeClock::new());

    scans.start(config("p", 1)).await.unwrap();
    let err = scans.start(config("p", 1)).await.unwrap_err();
    assert!(matches!(err, StoreError::ProjectLocked(p) if p == "p"));

    // A different project is unaffected.
    scans.start(config("q", 1)).await.unwrap();
}

#[tokio::test]
async fn active_returns_running_scan_and_prunes_dangling_pointer() {
    let kv = MemoryDriver::new();
    let scans = store(kv.clone(), FakeClock::new());

    assert!(scans.active("p").await.unwrap().is_none());

    let scan = scans.start(config("p", 1)).await.unwrap();
    let active = scans.active("p").await.unwrap().unwrap();
    assert_eq!(active.id, scan.id);

    // Hash gone (TTL expiry): pointer is pruned.
    kv.force_del(&keys::scan(scan.id.as_str()));
    assert!(scans.active("p").await.unwrap().is_none());
    assert!(!kv.exists(&keys::active_scan("p")).await.unwrap());
}

#[tokio::test]
async fn counters_floor_at_zero() {
    let kv = MemoryDriver::new();
    let scans = store(kv, FakeClock::new());
    let scan = scans.start(config("p", 2)).await.unwrap();

    // markCompleted without a prior markRunning: running floors at 0.
    let reply = scans.mark_completed("p", &scan.id, false).await.unwrap();
    assert_eq!(reply.completed, 1);
    assert_eq!(reply.status, "running");

    let fetched = scans.get(&scan.id).await.unwrap();
    assert_eq!(fetched.running, 0);
    assert_eq!(fetched.completed, 1);
}

#[tokio::test]
async fn auto_finish_on_last_resolution() {
    let kv = MemoryDriver::new();
    let clock = FakeClock::at(10_000);
    let scans = store(kv.clone(), clock.clone());
    let scan = scans.start(config("p", 1)).await.unwrap();

    scans.mark_running("p", &scan.id).await.unwrap();
    clock.advance_ms(500);
    let reply = scans.mark_completed("p", &scan.id, true).await.unwrap();

    assert_eq!(reply.status, "completed");
    assert_eq!(reply.drifted, 1);
    assert_eq!(reply.ended_at_ms, 10_500);

    // Terminal bookkeeping: lock released, pointer cleared, last set,
    // running index empty.
    assert!(!kv.exists(&keys::project_lock("p")).await.unwrap());
    assert!(!kv.exists(&keys::active_scan("p")).await.unwrap());
    assert_eq!(
        kv.get(&keys::last_scan("p")).await.unwrap(),
        Some(scan.id.to_string())
    );
    assert_eq!(kv.zcard(keys::RUNNING_SCANS).await.unwrap(), 0);

    // And the project can start a new scan immediately.
    scans.start(config("p", 1)).await.unwrap();
}

#[tokio::test]
async fn zero_total_scan_fails_on_first_transition() {
    let kv = MemoryDriver::new();
    let scans = store(kv.clone(), FakeClock::new());
    let scan = scans.start(config("p", 0)).await.unwrap();

    let reply = scans.mark_enqueue_failed("p", &scan.id).await.unwrap();
    assert_eq!(reply.status, "failed");
    assert_eq!(reply.failed, 1);
    assert!(reply.ended_at_ms > 0);
    assert!(!kv.exists(&keys::project_lock("p")).await.unwrap());
}

#[tokio::test]
async fn enqueue_skipped_shrinks_the_total() {
    let kv = MemoryDriver::new();
    let scans = store(kv, FakeClock::new());
    let scan = scans.start(config("p", 2)).await.unwrap();

    // One stack filtered out after the total was set; the other completes.
    scans.mark_enqueue_skipped("p", &scan.id).await.unwrap();
    scans.mark_running("p", &scan.id).await.unwrap();
    let reply = scans.mark_completed("p", &scan.id, false).await.unwrap();

    assert_eq!(reply.status, "completed");
    assert_eq!(reply.total, 1);
    assert_eq!(reply.completed, 1);
}

#[tokio::test]
async fn all_failures_finish_failed() {
    let kv = MemoryDriver::new();
    let scans = store(kv, FakeClock::new());
    let scan = scans.start(config("p", 2)).await.unwrap();

    scans.mark_running("p", &scan.id).await.unwrap();
    scans.mark_running("p", &scan.id).await.unwrap();
    scans.mark_failed("p", &scan.id).await.unwrap();
    let reply = scans.mark_failed("p", &scan.id).await.unwrap();

    assert_eq!(reply.status, "failed");
    assert_eq!(reply.failed, 2);

    let scan = scans.get(&scan.id).await.unwrap();
    assert_eq!(scan.errored, 2);
    assert!(scan.ended_at > 0);
}

#[tokio::test]
async fn retry_keeps_scan_running() {
    let kv = MemoryDriver::new();
    let scans = store(kv, FakeClock::new());
    let scan = scans.start(config("p", 1)).await.unwrap();

    scans.mark_running("p", &scan.id).await.unwrap();
    let reply = scans.mark_retry("p", &scan.id).await.unwrap();
    assert_eq!(reply.status, "running");

    let fetched = scans.get(&scan.id).await.unwrap();
    assert_eq!(fetched.queued, 1);
    assert_eq!(fetched.running, 0);
}

#[tokio::test]
async fn transitions_on_missing_scan_report_not_found() {
    let kv = MemoryDriver::new();
    let scans = store(kv, FakeClock::new());
    let err = scans
        .mark_running("p", &ScanId::new("p:404"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ScanNotFound(_)));
}

#[tokio::test]
async fn fail_scan_never_touches_a_foreign_lock() {
    let kv = MemoryDriver::new();
    let scans = store(kv.clone(), FakeClock::new());

    // Scan A holds the lock; the key vanishes (TTL lapse), scan B takes over.
    let a = scans.start(config("p", 1)).await.unwrap();
    kv.force_del(&keys::project_lock("p"));
    kv.force_del(&keys::active_scan("p"));
    let b = scans.start(config("p", 1)).await.unwrap();

    let failed = scans.fail(&a.id, "lost the lock").await.unwrap();
    assert_eq!(failed.status, ScanStatus::Failed);
    assert!(failed.ended_at > 0);

    // B's lock and pointer are intact.
    assert_eq!(
        kv.get(&keys::project_lock("p")).await.unwrap(),
        Some(b.id.to_string())
    );
    assert_eq!(
        kv.get(&keys::active_scan("p")).await.unwrap(),
        Some(b.id.to_string())
    );
}

#[tokio::test]
async fn finish_is_idempotent_on_terminal_scans() {
    let kv = MemoryDriver::new();
    let scans = store(kv, FakeClock::new());
    let scan = scans.start(config("p", 1)).await.unwrap();

    let canceled = scans.cancel(&scan.id, "user").await.unwrap();
    assert_eq!(canceled.status, ScanStatus::Canceled);
    let ended_at = canceled.ended_at;

    // A later fail does not overwrite the terminal state.
    let again = scans.fail(&scan.id, "too late").await.unwrap();
    assert_eq!(again.status, ScanStatus::Canceled);
    assert_eq!(again.ended_at, ended_at);
}

#[tokio::test]
async fn cancel_releases_lock_and_sets_last_pointer() {
    let kv = MemoryDriver::new();
    let scans = store(kv.clone(), FakeClock::new());
    let scan = scans.start(config("p", 3)).await.unwrap();

    scans.cancel(&scan.id, "user requested").await.unwrap();

    assert!(!kv.exists(&keys::project_lock("p")).await.unwrap());
    assert!(!kv.exists(&keys::active_scan("p")).await.unwrap());
    assert_eq!(
        kv.get(&keys::last_scan("p")).await.unwrap(),
        Some(scan.id.to_string())
    );
    let fetched = scans.get(&scan.id).await.unwrap();
    assert_eq!(fetched.error, "user requested");
}

#[tokio::test]
async fn cancel_and_start_supersedes_atomically() {
    let kv = MemoryDriver::new();
    let scans = store(kv.clone(), FakeClock::new());
    let old = scans.start(config("p", 2)).await.unwrap();

    let new = scans
        .cancel_and_start(&old.id, config("p", 3))
        .await
        .unwrap()
        .unwrap();

    assert_ne!(new.id, old.id);
    assert_eq!(
        kv.get(&keys::project_lock("p")).await.unwrap(),
        Some(new.id.to_string())
    );
    assert_eq!(
        kv.get(&keys::active_scan("p")).await.unwrap(),
        Some(new.id.to_string())
    );
    assert_eq!(
        kv.get(&keys::last_scan("p")).await.unwrap(),
        Some(old.id.to_string())
    );

    let old_scan = scans.get(&old.id).await.unwrap();
    assert_eq!(old_scan.status, ScanStatus::Canceled);
    assert_eq!(old_scan.error, "superseded by new trigger");

    let new_scan = scans.get(&new.id).await.unwrap();
    assert_eq!(new_scan.status, ScanStatus::Running);
    assert_eq!(new_scan.total, 3);
}

#[tokio::test]
async fn cancel_and_start_guard_fails_when_lock_moved() {
    let kv = MemoryDriver::new();
    let scans = store(kv.clone(), FakeClock::new());
    let old = scans.start(config("p", 1)).await.unwrap();

    // A third party stole the lock in between.
    kv.force_del(&keys::project_lock("p"));
    kv.set(&keys::project_lock("p"), "p:thief", None).await.unwrap();

    let result = scans
        .cancel_and_start(&old.id, config("p", 1))
        .await
        .unwrap();
    assert!(result.is_none());

    // Nothing was mutated: old scan still running, thief keeps the lock.
    assert_eq!(scans.get(&old.id).await.unwrap().status, ScanStatus::Running);
    assert_eq!(
        kv.get(&keys::project_lock("p")).await.unwrap(),
        Some("p:thief".to_string())
    );
}

#[tokio::test]
async fn renew_lock_reports_not_owned_for_foreign_owner() {
    let kv = MemoryDriver::new();
    let scans = store(kv.clone(), FakeClock::new());
    let scan = scans.start(config("p", 1)).await.unwrap();

    scans.renew_lock(&scan).await.unwrap();

    kv.force_del(&keys::project_lock("p"));
    kv.set(&keys::project_lock("p"), "someone-else", None)
        .await
        .unwrap();
    let err = scans.renew_lock(&scan).await.unwrap_err();
    assert!(matches!(err, StoreError::LockNotOwned(_)));
}

#[tokio::test]
async fn stale_scans_are_failed_with_max_age_error() {
    let kv = MemoryDriver::new();
    let clock = FakeClock::at(10_000_000);
    let scans = store(kv.clone(), clock.clone());

    let scan = scans.start(config("p", 1)).await.unwrap();
    // Two hours pass without progress.
    clock.advance_ms(2 * 60 * 60 * 1000);

    let recovered = scans
        .recover_stale(Duration::from_secs(60 * 60))
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let failed = scans.get(&scan.id).await.unwrap();
    assert_eq!(failed.status, ScanStatus::Failed);
    assert_eq!(failed.error, "exceeded maximum duration");
    assert!(failed.ended_at > 0);
    assert_eq!(kv.zcard(keys::RUNNING_SCANS).await.unwrap(), 0);
}

#[tokio::test]
async fn stale_recovery_prunes_dangling_index_entries() {
    let kv = MemoryDriver::new();
    let clock = FakeClock::at(10_000_000);
    let scans = store(kv.clone(), clock.clone());

    kv.zadd(keys::RUNNING_SCANS, "p:gone", 1.0, false)
        .await
        .unwrap();
    clock.advance_ms(60_000);

    let recovered = scans.recover_stale(Duration::from_secs(1)).await.unwrap();
    assert_eq!(recovered, 0);
    assert_eq!(kv.zcard(keys::RUNNING_SCANS).await.unwrap(), 0);
}

#[tokio::test]
async fn fresh_scans_survive_stale_recovery() {
    let kv = MemoryDriver::new();
    let clock = FakeClock::at(10_000_000);
    let scans = store(kv, clock.clone());

    let scan = scans.start(config("p", 1)).await.unwrap();
    clock.advance_ms(10_000);

    let recovered = scans
        .recover_stale(Duration::from_secs(60 * 60))
        .await
        .unwrap();
    assert_eq!(recovered, 0);
    assert_eq!(scans.get(&scan.id).await.unwrap().status, ScanStatus::Running);
}

#[tokio::test]
async fn rebuild_running_index_restores_running_scans() {
    let kv = MemoryDriver::new();
    let scans = store(kv.clone(), FakeClock::new());

    let a = scans.start(config("a", 1)).await.unwrap();
    let b = scans.start(config("b", 1)).await.unwrap();
    scans.cancel(&b.id, "done").await.unwrap();

    // Index wiped (e.g. manual intervention); rebuild restores only the
    // running scan.
    kv.force_del(keys::RUNNING_SCANS);
    let added = scans.rebuild_running_index().await.unwrap();
    assert_eq!(added, 1);

    let members = kv
        .zrange_by_score(keys::RUNNING_SCANS, f64::NEG_INFINITY, f64::INFINITY)
        .await
        .unwrap();
    assert_eq!(members, vec![a.id.to_string()]);

    // Idempotent: a second rebuild adds nothing.
    assert_eq!(scans.rebuild_running_index().await.unwrap(), 0);
}

#[tokio::test]
async fn last_returns_most_recent_terminal_scan() {
    let kv = MemoryDriver::new();
    let scans = store(kv, FakeClock::new());

    assert!(scans.last("p").await.unwrap().is_none());

    let scan = scans.start(config("p", 0)).await.unwrap();
    scans.mark_enqueue_failed("p", &scan.id).await.unwrap();

    let last = scans.last("p").await.unwrap().unwrap();
    assert_eq!(last.id, scan.id);
    assert_eq!(last.status, ScanStatus::Failed);
}
