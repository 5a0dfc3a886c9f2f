// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker pool: cooperative dequeue loops feeding results back into scan
//! counters.
//!
//! Workers never write to scan hashes except through the counter scripts and
//! never touch locks except via the CAS primitives — everything goes through
//! the store. A single stack-scan failure never takes the process down.

use crate::auth::AuthProvider;
use crate::error::EngineError;
use crate::runner::{RunParams, Runner};
use driftd_core::scan::{Scan, ScanStatus};
use driftd_core::stack_scan::StackScan;
use driftd_core::{Clock, WorkerConfig, WorkerId};
use driftd_kv::KvDriver;
use driftd_store::queue::Dequeued;
use driftd_store::{EventPublisher, Scans, StackScanQueue, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Per-iteration dequeue window.
const DEQUEUE_WINDOW: Duration = Duration::from_secs(30);

/// Backoff after a KV transport failure.
const TRANSPORT_BACKOFF: Duration = Duration::from_secs(5);

/// How often the cancel watcher polls the parent scan.
const CANCEL_POLL: Duration = Duration::from_secs(3);

/// How a single execution attempt ended.
enum Attempt {
    Finished(crate::runner::RunResult),
    /// Parent scan flipped to canceled mid-run.
    Canceled,
    /// `stack_timeout` elapsed.
    TimedOut,
    /// Transport/internal failure before a plan verdict.
    Errored(String),
}

/// A pool of cooperative dequeue loops sharing one runner and one KV.
#[derive(Clone)]
pub struct WorkerPool<D, C, R, A> {
    queue: StackScanQueue<D, C>,
    scans: Scans<D, C>,
    publisher: EventPublisher<D, C>,
    runner: R,
    auth: A,
    clock: C,
    config: WorkerConfig,
}

impl<D, C, R, A> WorkerPool<D, C, R, A>
where
    D: KvDriver,
    C: Clock,
    R: Runner,
    A: AuthProvider,
{
    pub fn new(
        kv: D,
        clock: C,
        runner: R,
        auth: A,
        config: WorkerConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            queue: StackScanQueue::new(kv.clone(), clock.clone()),
            scans: Scans::new(kv.clone(), clock.clone(), config.lock_ttl),
            publisher: EventPublisher::new(kv, clock.clone()),
            runner,
            auth,
            clock,
            config,
        })
    }

    /// Spawn `concurrency` dequeue loops. Loops exit when `shutdown` flips
    /// to true, finishing their current attempt first.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let instance = uuid::Uuid::new_v4();
        (0..self.config.concurrency)
            .map(|i| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                let worker_id = WorkerId::new(format!("{instance}-{i}"));
                tokio::spawn(async move { pool.run_loop(worker_id, shutdown).await })
            })
            .collect()
    }

    /// One dequeue loop: pop, process, repeat until shutdown.
    pub async fn run_loop(&self, worker_id: WorkerId, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %worker_id, "worker loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let dequeued = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.queue.dequeue(&worker_id, DEQUEUE_WINDOW) => result,
            };
            match dequeued {
                Ok(None) => continue,
                Ok(Some(dequeued)) => {
                    if let Err(err) = self.process(dequeued).await {
                        tracing::error!(worker = %worker_id, error = %err, "stack-scan processing error");
                        if err.is_transport() {
                            self.backoff(&mut shutdown).await;
                        }
                    }
                }
                Err(err) if err.is_transport() => {
                    tracing::warn!(worker = %worker_id, error = %err, "kv unreachable, backing off");
                    self.backoff(&mut shutdown).await;
                }
                Err(err) => {
                    tracing::error!(worker = %worker_id, error = %err, "dequeue error");
                }
            }
        }
        tracing::info!(worker = %worker_id, "worker loop stopped");
    }

    async fn backoff(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(TRANSPORT_BACKOFF) => {}
        }
    }

    /// Dequeue one item (up to `timeout`) and see it through to a terminal
    /// or retried state. Returns whether an item was processed.
    pub async fn process_one(
        &self,
        worker_id: &WorkerId,
        timeout: Duration,
    ) -> Result<bool, EngineError> {
        match self.queue.dequeue(worker_id, timeout).await? {
            Some(dequeued) => {
                self.process(dequeued).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process(&self, dequeued: Dequeued) -> Result<(), EngineError> {
        let mut ss = dequeued.stack_scan;
        self.publisher
            .publish(&self.publisher.stack_update(&ss, "running", None, None))
            .await;
        if let Some(reply) = &dequeued.scan {
            self.publisher
                .publish(&self.publisher.scan_update(&ss.project, ss.scan_id.as_str(), reply))
                .await;
        }

        // Scan context: parent scan, version inheritance, workspace.
        let parent = self.parent_scan(&ss).await?;
        if let Some(scan) = &parent {
            if scan.status == ScanStatus::Canceled {
                return self.report_canceled(&mut ss).await;
            }
        }

        let mut params = RunParams {
            run_id: ss.id.to_string(),
            project: ss.project.clone(),
            project_url: ss.project_url.clone(),
            stack_path: ss.stack_path.clone(),
            tool_versions: parent
                .as_ref()
                .map(|scan| scan.versions_for(&ss.stack_path))
                .unwrap_or_default(),
            commit_sha: parent
                .as_ref()
                .map(|scan| scan.commit_sha.clone())
                .unwrap_or_default(),
            workspace_path: parent
                .as_ref()
                .map(|scan| scan.workspace_path.clone())
                .unwrap_or_default(),
            clone_depth: 1,
            auth: None,
            cleanup: true,
        };
        // Auth only matters when the runner has to fetch the repo itself.
        if params.workspace_path.is_empty() {
            match self.auth.resolve(&ss.project_url).await {
                Ok(auth) => params.auth = auth,
                Err(err) => {
                    return self.report_failure(&mut ss, &format!("auth: {err}")).await;
                }
            }
        }

        let attempt = self.execute(&ss, &params).await;

        if params.cleanup && !params.workspace_path.is_empty() {
            if let Err(err) = self.runner.cleanup(&params).await {
                tracing::warn!(id = %ss.id, error = %err, "stack cleanup failed");
            }
        }

        match attempt {
            Attempt::Canceled => self.report_canceled(&mut ss).await,
            Attempt::TimedOut => {
                self.report_failure(&mut ss, "exceeded stack timeout").await
            }
            Attempt::Errored(msg) => self.report_failure(&mut ss, &msg).await,
            Attempt::Finished(result) if result.error.is_empty() => {
                let reply = self.queue.complete(&mut ss, result.drifted).await?;
                self.publisher
                    .publish(&self.publisher.stack_update(
                        &ss,
                        "completed",
                        Some(result.drifted),
                        None,
                    ))
                    .await;
                self.publish_scan_reply(&ss, reply).await;
                Ok(())
            }
            Attempt::Finished(result) => self.report_failure(&mut ss, &result.error).await,
        }
    }

    async fn parent_scan(&self, ss: &StackScan) -> Result<Option<Scan>, EngineError> {
        if !ss.is_scan_attached() {
            return Ok(None);
        }
        match self.scans.get(&ss.scan_id).await {
            Ok(scan) => Ok(Some(scan)),
            Err(StoreError::ScanNotFound(_)) => {
                tracing::warn!(id = %ss.id, scan = %ss.scan_id, "parent scan missing, running standalone");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Run the plan under the stack deadline, with a watcher that aborts the
    /// attempt within ~3 s of the parent scan flipping to canceled.
    async fn execute(&self, ss: &StackScan, params: &RunParams) -> Attempt {
        let canceled = Arc::new(Notify::new());
        let watcher = ss.is_scan_attached().then(|| {
            let scans = self.scans.clone();
            let scan_id = ss.scan_id.clone();
            let canceled = Arc::clone(&canceled);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(CANCEL_POLL).await;
                    match scans.get(&scan_id).await {
                        Ok(scan) if scan.status == ScanStatus::Canceled => {
                            canceled.notify_one();
                            return;
                        }
                        Ok(scan) if scan.is_terminal() => return,
                        Ok(_) => {}
                        Err(StoreError::ScanNotFound(_)) => return,
                        Err(err) => {
                            // Transient KV trouble: keep watching.
                            tracing::debug!(scan = %scan_id, error = %err, "cancel watcher poll failed");
                        }
                    }
                }
            })
        });

        let run = self.runner.run(params.clone());
        tokio::pin!(run);
        let attempt = tokio::select! {
            result = tokio::time::timeout(self.config.stack_timeout, &mut run) => {
                match result {
                    Ok(Ok(result)) => Attempt::Finished(result),
                    Ok(Err(err)) => Attempt::Errored(err.to_string()),
                    Err(_) => Attempt::TimedOut,
                }
            }
            _ = canceled.notified() => Attempt::Canceled,
        };
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        attempt
    }

    async fn report_canceled(&self, ss: &mut StackScan) -> Result<(), EngineError> {
        self.queue.cancel(ss).await?;
        self.publisher
            .publish(&self.publisher.stack_update(ss, "canceled", None, None))
            .await;
        Ok(())
    }

    async fn report_failure(&self, ss: &mut StackScan, msg: &str) -> Result<(), EngineError> {
        let (_outcome, reply) = self.queue.fail(ss, msg).await?;
        self.publisher
            .publish(&self.publisher.stack_update(ss, "failed", None, Some(msg.to_string())))
            .await;
        self.publish_scan_reply(ss, reply).await;
        Ok(())
    }

    async fn publish_scan_reply(
        &self,
        ss: &StackScan,
        reply: Option<driftd_kv::TransitionReply>,
    ) {
        if let Some(reply) = reply {
            self.publisher
                .publish(&self.publisher.scan_update(&ss.project, ss.scan_id.as_str(), &reply))
                .await;
        }
    }

    /// Clock shared with the rest of the engine (metrics, tests).
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
