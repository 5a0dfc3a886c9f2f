// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Trigger dispatcher: converts an external trigger into a scan plus its
//! batch of stack-scans.
//!
//! When a trigger lands on a project with an active scan, the policy decides
//! whether to supersede it — through the atomic handoff, never via a naive
//! cancel-then-start (which has a window where a third caller steals the
//! lock). Scheduled triggers never supersede higher-priority work.

use crate::error::EngineError;
use crate::renew::{renew_scan_lock, RenewSettings};
use driftd_core::scan::{Scan, ScanConfig, ScanId};
use driftd_core::stack_scan::{StackScan, StackScanConfig};
use driftd_core::{Clock, TriggerKind, TriggerPolicy, WorkerConfig};
use driftd_kv::KvDriver;
use driftd_store::{EnqueueOutcome, EventPublisher, Scans, StackScanQueue, StoreError};
use std::collections::HashMap;
use tokio::sync::watch;

/// One external trigger.
#[derive(Debug, Clone, Default)]
pub struct TriggerRequest {
    pub project: String,
    pub project_url: String,
    pub trigger: Option<TriggerKind>,
    pub commit: String,
    pub actor: String,
    pub commit_sha: String,
    pub workspace_path: String,
    pub stacks: Vec<String>,
    pub tool_versions: HashMap<String, String>,
    pub tool_overrides: HashMap<String, HashMap<String, String>>,
}

/// Converts triggers into scans and enqueued stack-scans.
#[derive(Clone)]
pub struct Dispatcher<D, C> {
    scans: Scans<D, C>,
    queue: StackScanQueue<D, C>,
    publisher: EventPublisher<D, C>,
    clock: C,
    policy: TriggerPolicy,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<D: KvDriver, C: Clock> Dispatcher<D, C> {
    pub fn new(
        kv: D,
        clock: C,
        config: WorkerConfig,
        policy: TriggerPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            scans: Scans::new(kv.clone(), clock.clone(), config.lock_ttl),
            queue: StackScanQueue::new(kv.clone(), clock.clone()),
            publisher: EventPublisher::new(kv, clock.clone()),
            clock,
            policy,
            config,
            shutdown,
        })
    }

    /// Dispatch one trigger: start (or supersede into) a scan, enqueue the
    /// stack batch, and settle the counters for anything that could not be
    /// enqueued. Returns the new scan id.
    pub async fn trigger(&self, req: TriggerRequest) -> Result<ScanId, EngineError> {
        let config = ScanConfig {
            project: req.project.clone(),
            trigger: req.trigger,
            commit: req.commit.clone(),
            actor: req.actor.clone(),
            commit_sha: req.commit_sha.clone(),
            workspace_path: req.workspace_path.clone(),
            tool_versions: req.tool_versions.clone(),
            tool_overrides: req.tool_overrides.clone(),
            total: req.stacks.len() as i64,
        };

        let scan = match self.scans.start(config.clone()).await {
            Ok(scan) => scan,
            Err(StoreError::ProjectLocked(_)) => self.supersede(&req, config).await?,
            Err(err) => return Err(err.into()),
        };

        self.publisher
            .publish(&self.publisher.scan_update_full(&scan))
            .await;
        self.spawn_renewal(&scan);

        if req.stacks.is_empty() {
            // No stacks means no work: the first transition fails the scan.
            let reply = self
                .scans
                .mark_enqueue_failed(&req.project, &scan.id)
                .await?;
            self.publisher
                .publish(&self.publisher.scan_update(&req.project, scan.id.as_str(), &reply))
                .await;
            return Ok(scan.id);
        }

        let items: Vec<StackScan> = req
            .stacks
            .iter()
            .map(|stack| {
                StackScan::new(
                    StackScanConfig {
                        scan_id: scan.id.clone(),
                        project: req.project.clone(),
                        project_url: req.project_url.clone(),
                        stack_path: stack.clone(),
                        max_retries: self.config.max_retries(),
                    },
                    &self.clock,
                )
            })
            .collect();

        for result in self.queue.enqueue_batch(items).await? {
            match &result.outcome {
                EnqueueOutcome::Enqueued => {}
                EnqueueOutcome::SkippedInflight => {
                    tracing::info!(
                        scan = %scan.id,
                        stack = %result.item.stack_path,
                        "stack already inflight, skipped"
                    );
                    let reply = self
                        .scans
                        .mark_enqueue_skipped(&req.project, &scan.id)
                        .await?;
                    self.publisher
                        .publish(&self.publisher.scan_update(&req.project, scan.id.as_str(), &reply))
                        .await;
                }
                EnqueueOutcome::Failed(msg) => {
                    tracing::warn!(
                        scan = %scan.id,
                        stack = %result.item.stack_path,
                        error = msg,
                        "stack enqueue failed"
                    );
                    let reply = self
                        .scans
                        .mark_enqueue_failed(&req.project, &scan.id)
                        .await?;
                    self.publisher
                        .publish(&self.publisher.scan_update(&req.project, scan.id.as_str(), &reply))
                        .await;
                }
            }
        }
        Ok(scan.id)
    }

    /// Policy gate and atomic supersede of the active scan.
    async fn supersede(
        &self,
        req: &TriggerRequest,
        config: ScanConfig,
    ) -> Result<Scan, EngineError> {
        if !self.policy.cancel_inflight_on_new_trigger {
            return Err(StoreError::ProjectLocked(req.project.clone()).into());
        }
        let Some(active) = self.scans.active(&req.project).await? else {
            // Lock held but no active pointer (startup gap): let the caller
            // retry rather than guessing an owner to supersede.
            return Err(StoreError::ProjectLocked(req.project.clone()).into());
        };

        let new_priority = req.trigger.map(|t| t.priority()).unwrap_or(2);
        let active_priority = active.trigger.map(|t| t.priority()).unwrap_or(1);
        if new_priority < active_priority {
            return Err(StoreError::ProjectLocked(req.project.clone()).into());
        }

        let old_id = active.id.clone();
        match self.scans.cancel_and_start(&old_id, config).await? {
            Some(scan) => {
                // Follow-up outside the atomic step: tell subscribers the
                // old scan is gone.
                if let Ok(old) = self.scans.get(&old_id).await {
                    self.publisher
                        .publish(&self.publisher.scan_update_full(&old))
                        .await;
                }
                Ok(scan)
            }
            None => Err(StoreError::ProjectLocked(req.project.clone()).into()),
        }
    }

    /// Cancel the project's active scan, if any. Workers cascade the
    /// cancellation to in-flight and pending stack-scans.
    pub async fn cancel_active(
        &self,
        project: &str,
        reason: &str,
    ) -> Result<Option<ScanId>, EngineError> {
        let Some(active) = self.scans.active(project).await? else {
            return Ok(None);
        };
        let scan = self.scans.cancel(&active.id, reason).await?;
        self.publisher
            .publish(&self.publisher.scan_update_full(&scan))
            .await;
        Ok(Some(scan.id))
    }

    fn spawn_renewal(&self, scan: &Scan) {
        let settings = RenewSettings {
            renew_every: self.config.renew_every,
            scan_max_age: self.config.scan_max_age,
        };
        let scans = self.scans.clone();
        let publisher = self.publisher.clone();
        let clock = self.clock.clone();
        let scan_id = scan.id.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            renew_scan_lock(scans, publisher, clock, scan_id, settings, shutdown).await;
        });
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
