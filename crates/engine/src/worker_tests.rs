// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::auth::NoAuthProvider;
use crate::runner::fake::FakeRunner;
use crate::runner::RunResult;
use driftd_core::scan::{ScanConfig, ScanId};
use driftd_core::stack_scan::{StackScanConfig, StackScanStatus};
use driftd_core::{FakeClock, ScanEvent, WorkerConfig};
use driftd_kv::MemoryDriver;

type TestPool = WorkerPool<MemoryDriver, FakeClock, FakeRunner, NoAuthProvider>;

const DEQ: Duration = Duration::from_millis(200);

fn pool(kv: &MemoryDriver, clock: &FakeClock, runner: &FakeRunner) -> TestPool {
    pool_with(kv, clock, runner, WorkerConfig::default())
}

fn pool_with(
    kv: &MemoryDriver,
    clock: &FakeClock,
    runner: &FakeRunner,
    config: WorkerConfig,
) -> TestPool {
    WorkerPool::new(
        kv.clone(),
        clock.clone(),
        runner.clone(),
        NoAuthProvider,
        config,
    )
    .unwrap()
}

struct Fixture {
    kv: MemoryDriver,
    clock: FakeClock,
    scans: Scans<MemoryDriver, FakeClock>,
    queue: StackScanQueue<MemoryDriver, FakeClock>,
}

impl Fixture {
    fn new() -> Self {
        let kv = MemoryDriver::new();
        let clock = FakeClock::new();
        Self {
            scans: Scans::new(kv.clone(), clock.clone(), Duration::from_secs(300)),
            queue: StackScanQueue::new(kv.clone(), clock.clone()),
            kv,
            clock,
        }
    }

    async fn seed_scan(&self, project: &str, total: i64) -> ScanId {
        self.scans
            .start(ScanConfig {
                project: project.to_string(),
                workspace_path: "/work/checkout".to_string(),
                total,
                ..ScanConfig::default()
            })
            .await
            .unwrap()
            .id
    }

    async fn enqueue(&self, scan_id: &ScanId, stack: &str, max_retries: u32) -> StackScan {
        let mut ss = StackScan::new(
            StackScanConfig {
                scan_id: scan_id.clone(),
                project: "p".to_string(),
                project_url: "https://git.example.com/p.git".to_string(),
                stack_path: stack.to_string(),
                max_retries,
            },
            &self.clock,
        );
        self.queue.enqueue(&mut ss).await.unwrap();
        ss
    }
}

#[tokio::test]
async fn happy_path_completes_and_finishes_the_scan() {
    let f = Fixture::new();
    let runner = FakeRunner::new();
    runner.push_result("envs/dev", RunResult::with_drift(2, 1, 0));
    let pool = pool(&f.kv, &f.clock, &runner);

    let scan_id = f.seed_scan("p", 1).await;
    let ss = f.enqueue(&scan_id, "envs/dev", 0).await;

    let mut sub = f.kv.psubscribe("events:*").await.unwrap();
    let processed = pool
        .process_one(&WorkerId::new("w-1"), DEQ)
        .await
        .unwrap();
    assert!(processed);

    let done = f.queue.get(ss.id.as_str()).await.unwrap();
    assert_eq!(done.status, StackScanStatus::Completed);

    let scan = f.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.completed, 1);
    assert_eq!(scan.drifted, 1);
    assert!(scan.ended_at > 0);

    // running stack event, running scan snapshot, completed stack event,
    // terminal scan snapshot.
    let mut statuses = Vec::new();
    for _ in 0..4 {
        let msg = sub.recv().await.unwrap();
        let event: ScanEvent = serde_json::from_str(&msg.payload).unwrap();
        statuses.push((
            matches!(event, ScanEvent::StackUpdate { .. }),
            event.status().to_string(),
        ));
    }
    assert_eq!(
        statuses,
        vec![
            (true, "running".to_string()),
            (false, "running".to_string()),
            (true, "completed".to_string()),
            (false, "completed".to_string()),
        ]
    );

    // The runner saw the inherited workspace.
    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].workspace_path, "/work/checkout");
    // Artifacts were cleaned up for the materialized workspace.
    assert_eq!(runner.cleanups().len(), 1);
}

#[tokio::test]
async fn plan_error_retries_then_completes() {
    let f = Fixture::new();
    let runner = FakeRunner::new();
    runner.push_result("envs/dev", RunResult::plan_error("boom"));
    let pool = pool(&f.kv, &f.clock, &runner);

    let scan_id = f.seed_scan("p", 1).await;
    let ss = f.enqueue(&scan_id, "envs/dev", 1).await;

    pool.process_one(&WorkerId::new("w-1"), DEQ).await.unwrap();

    // First attempt failed with budget left: item pending again, scan still
    // running.
    let retried = f.queue.get(ss.id.as_str()).await.unwrap();
    assert_eq!(retried.status, StackScanStatus::Pending);
    assert_eq!(retried.retries, 1);
    assert_eq!(retried.error, "boom");
    let scan = f.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Running);
    assert_eq!(scan.queued, 1);

    // Second attempt (unscripted = clean) completes the scan.
    pool.process_one(&WorkerId::new("w-1"), DEQ).await.unwrap();
    let scan = f.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.completed, 1);
    assert_eq!(scan.failed, 0);
}

#[tokio::test]
async fn runner_transport_error_fails_the_item() {
    let f = Fixture::new();
    let runner = FakeRunner::new();
    runner.push_error("envs/dev", "ssh: connection refused");
    let pool = pool(&f.kv, &f.clock, &runner);

    let scan_id = f.seed_scan("p", 1).await;
    let ss = f.enqueue(&scan_id, "envs/dev", 0).await;

    pool.process_one(&WorkerId::new("w-1"), DEQ).await.unwrap();

    let failed = f.queue.get(ss.id.as_str()).await.unwrap();
    assert_eq!(failed.status, StackScanStatus::Failed);
    assert!(failed.error.contains("connection refused"));

    let scan = f.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Failed);
    assert_eq!(scan.errored, 1);
}

#[tokio::test]
async fn pending_items_of_a_canceled_scan_never_run() {
    let f = Fixture::new();
    let runner = FakeRunner::new();
    let pool = pool(&f.kv, &f.clock, &runner);

    let scan_id = f.seed_scan("p", 2).await;
    let ss = f.enqueue(&scan_id, "envs/dev", 0).await;
    f.enqueue(&scan_id, "envs/prod", 0).await;

    f.scans.cancel(&scan_id, "user").await.unwrap();

    pool.process_one(&WorkerId::new("w-1"), DEQ).await.unwrap();
    pool.process_one(&WorkerId::new("w-1"), DEQ).await.unwrap();

    let item = f.queue.get(ss.id.as_str()).await.unwrap();
    assert_eq!(item.status, StackScanStatus::Canceled);
    // The plan never ran.
    assert!(runner.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_watcher_aborts_inflight_runs() {
    let f = Fixture::new();
    let runner = FakeRunner::new();
    runner.set_delay(Duration::from_secs(600));
    let pool = pool(&f.kv, &f.clock, &runner);

    let scan_id = f.seed_scan("p", 1).await;
    let ss = f.enqueue(&scan_id, "envs/dev", 0).await;

    // Cancel the scan a few seconds into the run.
    let scans = f.scans.clone();
    let to_cancel = scan_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        scans.cancel(&to_cancel, "user").await.unwrap();
    });

    pool.process_one(&WorkerId::new("w-1"), DEQ).await.unwrap();

    // The watchdog saw the cancel within its ~3 s poll and aborted the
    // attempt long before the 600 s plan finished.
    let item = f.queue.get(ss.id.as_str()).await.unwrap();
    assert_eq!(item.status, StackScanStatus::Canceled);
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stack_timeout_fails_the_attempt() {
    let f = Fixture::new();
    let runner = FakeRunner::new();
    runner.set_delay(Duration::from_secs(600));
    let config = WorkerConfig {
        stack_timeout: Duration::from_secs(30),
        ..WorkerConfig::default()
    };
    let pool = pool_with(&f.kv, &f.clock, &runner, config);

    let scan_id = f.seed_scan("p", 1).await;
    let ss = f.enqueue(&scan_id, "envs/dev", 0).await;

    pool.process_one(&WorkerId::new("w-1"), DEQ).await.unwrap();

    let failed = f.queue.get(ss.id.as_str()).await.unwrap();
    assert_eq!(failed.status, StackScanStatus::Failed);
    assert!(failed.error.contains("stack timeout"));
}

#[tokio::test]
async fn standalone_items_complete_without_scan_counters() {
    let f = Fixture::new();
    let runner = FakeRunner::new();
    let pool = pool(&f.kv, &f.clock, &runner);

    let mut ss = StackScan::new(
        StackScanConfig {
            scan_id: ScanId::default(),
            project: "p".to_string(),
            project_url: String::new(),
            stack_path: "envs/dev".to_string(),
            max_retries: 0,
        },
        &f.clock,
    );
    f.queue.enqueue(&mut ss).await.unwrap();

    pool.process_one(&WorkerId::new("w-1"), DEQ).await.unwrap();

    let done = f.queue.get(ss.id.as_str()).await.unwrap();
    assert_eq!(done.status, StackScanStatus::Completed);
}

#[tokio::test]
async fn process_one_reports_no_work() {
    let f = Fixture::new();
    let pool = pool(&f.kv, &f.clock, &FakeRunner::new());
    let processed = pool
        .process_one(&WorkerId::new("w-1"), Duration::from_millis(50))
        .await
        .unwrap();
    assert!(!processed);
}

#[tokio::test(start_paused = true)]
async fn spawned_loops_drain_work_and_stop_on_shutdown() {
    let f = Fixture::new();
    let runner = FakeRunner::new();
    let pool = pool(&f.kv, &f.clock, &runner);

    let scan_id = f.seed_scan("p", 2).await;
    f.enqueue(&scan_id, "envs/dev", 0).await;
    f.enqueue(&scan_id, "envs/prod", 0).await;

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handles = pool.spawn(rx);
    assert_eq!(handles.len(), WorkerConfig::default().concurrency);

    // Wait for the scan to finish.
    for _ in 0..1_000 {
        let scan = f.scans.get(&scan_id).await.unwrap();
        if scan.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let scan = f.scans.get(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.completed, 2);

    tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}
