// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared harness for the scenario tests.

use driftd_core::scan::ScanId;
use driftd_core::{FakeClock, TriggerKind, TriggerPolicy, WorkerConfig, WorkerId};
use driftd_engine::{Dispatcher, FakeRunner, NoAuthProvider, TriggerRequest, WorkerPool};
use driftd_kv::MemoryDriver;
use driftd_store::{Scans, StackScanQueue};
use std::time::Duration;
use tokio::sync::watch;

/// Dequeue window used by the scenario workers.
pub const DEQ: Duration = Duration::from_millis(300);

/// Everything a scenario needs, wired to one in-memory KV.
pub struct Harness {
    pub kv: MemoryDriver,
    pub clock: FakeClock,
    pub runner: FakeRunner,
    pub dispatcher: Dispatcher<MemoryDriver, FakeClock>,
    pub pool: WorkerPool<MemoryDriver, FakeClock, FakeRunner, NoAuthProvider>,
    pub scans: Scans<MemoryDriver, FakeClock>,
    pub queue: StackScanQueue<MemoryDriver, FakeClock>,
    pub worker: WorkerId,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(WorkerConfig::default())
    }

    pub fn with_config(config: WorkerConfig) -> Self {
        let kv = MemoryDriver::new();
        let clock = FakeClock::new();
        let runner = FakeRunner::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            kv.clone(),
            clock.clone(),
            config.clone(),
            TriggerPolicy::default(),
            shutdown_rx,
        )
        .unwrap();
        let pool = WorkerPool::new(
            kv.clone(),
            clock.clone(),
            runner.clone(),
            NoAuthProvider,
            config.clone(),
        )
        .unwrap();
        Self {
            scans: Scans::new(kv.clone(), clock.clone(), config.lock_ttl),
            queue: StackScanQueue::new(kv.clone(), clock.clone()),
            dispatcher,
            pool,
            runner,
            worker: WorkerId::new("scenario-worker"),
            kv,
            clock,
            _shutdown: shutdown_tx,
        }
    }

    /// Dispatch a manual trigger for project `p`.
    pub async fn trigger(&self, stacks: &[&str]) -> ScanId {
        self.trigger_kind(TriggerKind::Manual, stacks).await
    }

    pub async fn trigger_kind(&self, kind: TriggerKind, stacks: &[&str]) -> ScanId {
        self.dispatcher
            .trigger(TriggerRequest {
                project: "p".to_string(),
                project_url: "https://git.example.com/p.git".to_string(),
                trigger: Some(kind),
                commit: "feat: reshape vpc".to_string(),
                actor: "dev".to_string(),
                stacks: stacks.iter().map(|s| s.to_string()).collect(),
                ..TriggerRequest::default()
            })
            .await
            .unwrap()
    }

    /// Process up to `n` queued items.
    pub async fn drain(&self, n: usize) {
        for _ in 0..n {
            self.pool.process_one(&self.worker, DEQ).await.unwrap();
        }
    }
}
