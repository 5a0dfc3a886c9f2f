// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stack-scan work queue: enqueue, claim, retry, dedup, recovery.
//!
//! Delivery is at-least-once: the FIFO list can briefly hold duplicate ids
//! (orphan recovery re-pushes), and the claim lock makes processing
//! effectively single-consumer per id. Dedup across attempts is the inflight
//! marker, held from enqueue until the item leaves the
//! pending/running states for good.

use crate::error::StoreError;
use crate::keys;
use crate::scan::counter_transition;
use driftd_core::scan::fields;
use driftd_core::stack_scan::{StackScan, StackScanId, StackScanStatus};
use driftd_core::{Clock, WorkerId};
use driftd_kv::{KvDriver, KvOp, TransitionReply};
use std::time::Duration;

/// BRPOP slice so dequeue stays responsive to cancellation.
const POP_SLICE: Duration = Duration::from_secs(1);

/// Per-item outcome of a batch enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A pending or running stack-scan already exists for this stack.
    SkippedInflight,
    /// The write pipeline failed; the inflight marker was rolled back.
    Failed(String),
}

/// One item of a batch enqueue result.
#[derive(Debug, Clone)]
pub struct EnqueueResult {
    pub item: StackScan,
    pub outcome: EnqueueOutcome,
}

/// What `fail` did with the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Retry budget remained: the item went back to pending and the queue.
    Requeued,
    /// Retries exhausted: the item is terminally failed.
    Exhausted,
}

/// A dequeued item plus the scan counter snapshot its claim produced.
#[derive(Debug, Clone)]
pub struct Dequeued {
    pub stack_scan: StackScan,
    /// Present when the item is scan-attached.
    pub scan: Option<TransitionReply>,
}

/// Stack-scan queue operations over the shared KV.
#[derive(Clone)]
pub struct StackScanQueue<D, C> {
    kv: D,
    clock: C,
}

impl<D: KvDriver, C: Clock> StackScanQueue<D, C> {
    pub fn new(kv: D, clock: C) -> Self {
        Self { kv, clock }
    }

    fn assign_id(&self, ss: &mut StackScan) {
        if ss.id.is_empty() {
            let nonce: u32 = rand::random();
            ss.id = StackScanId::new(format!(
                "{}:{}:{}:{:08x}",
                ss.project,
                ss.stack_path,
                self.clock.epoch_nanos(),
                nonce
            ));
        }
    }

    async fn save(&self, ss: &StackScan) -> Result<(), StoreError> {
        let blob = encode(ss)?;
        self.kv
            .set(&keys::stack_scan(ss.id.as_str()), &blob, Some(keys::RETENTION))
            .await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<StackScan>, StoreError> {
        let Some(blob) = self.kv.get(&keys::stack_scan(id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&blob) {
            Ok(ss) => Ok(Some(ss)),
            Err(err) => {
                tracing::warn!(id, error = %err, "undecodable stack-scan blob");
                Ok(None)
            }
        }
    }

    /// Fetch a stack-scan by id.
    pub async fn get(&self, id: &str) -> Result<StackScan, StoreError> {
        self.load(id)
            .await?
            .ok_or_else(|| StoreError::StackScanNotFound(id.to_string()))
    }

    /// Stack-scan ids for a project, newest first.
    pub async fn project_items(&self, project: &str, limit: usize) -> Result<Vec<StackScan>, StoreError> {
        let stop = if limit == 0 { -1 } else { limit as isize - 1 };
        let ids = self
            .kv
            .zrevrange(&keys::project_ordered(project), 0, stop)
            .await?;
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ss) = self.load(&id).await? {
                items.push(ss);
            }
        }
        Ok(items)
    }

    fn write_ops(&self, ss: &StackScan, blob: String) -> Vec<KvOp> {
        let id = ss.id.to_string();
        let mut ops = vec![
            KvOp::Set {
                key: keys::stack_scan(&id),
                value: blob,
                ttl: Some(keys::RETENTION),
            },
            KvOp::SAdd {
                key: keys::project_set(&ss.project),
                member: id.clone(),
            },
            KvOp::ZAdd {
                key: keys::project_ordered(&ss.project),
                member: id.clone(),
                score: ss.created_at as f64,
            },
            KvOp::SAdd {
                key: keys::PENDING_SET.to_string(),
                member: id.clone(),
            },
        ];
        if ss.is_scan_attached() {
            ops.push(KvOp::SAdd {
                key: keys::scan_children(ss.scan_id.as_str()),
                member: id.clone(),
            });
        }
        ops.push(KvOp::LPush {
            key: keys::QUEUE_WORKITEMS.to_string(),
            value: id,
        });
        ops
    }

    /// Enqueue one stack-scan. Assigns an id when empty, stamps
    /// `pending`/`created_at`, and acquires the inflight marker first; the
    /// marker is rolled back if the subsequent writes fail.
    pub async fn enqueue(&self, ss: &mut StackScan) -> Result<(), StoreError> {
        self.assign_id(ss);
        ss.status = StackScanStatus::Pending;
        ss.created_at = self.clock.epoch_ms();

        let inflight_key = keys::inflight(&ss.project, &ss.stack_path);
        if !self
            .kv
            .set_nx(&inflight_key, ss.id.as_str(), Some(keys::INFLIGHT_TTL))
            .await?
        {
            return Err(StoreError::AlreadyInflight {
                project: ss.project.clone(),
                stack_path: ss.stack_path.clone(),
            });
        }

        let blob = encode(ss)?;
        match self.kv.exec(self.write_ops(ss, blob)).await {
            Ok(_) => {
                tracing::debug!(id = %ss.id, stack = %ss.stack_path, "stack-scan enqueued");
                Ok(())
            }
            Err(err) => {
                let _ = self.kv.del(&inflight_key).await;
                Err(err.into())
            }
        }
    }

    /// Enqueue a batch in two pipelined roundtrips: one for every inflight
    /// SETNX, one for every write. Items that lose the SETNX are skipped;
    /// if the write pipeline fails, the just-acquired markers are rolled
    /// back and those items report `Failed`.
    pub async fn enqueue_batch(
        &self,
        items: Vec<StackScan>,
    ) -> Result<Vec<EnqueueResult>, StoreError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut prepared = items;
        for ss in &mut prepared {
            self.assign_id(ss);
            ss.status = StackScanStatus::Pending;
            ss.created_at = self.clock.epoch_ms();
        }

        let markers: Vec<String> = prepared
            .iter()
            .map(|ss| keys::inflight(&ss.project, &ss.stack_path))
            .collect();
        let setnx_ops: Vec<KvOp> = prepared
            .iter()
            .zip(&markers)
            .map(|(ss, key)| KvOp::SetNx {
                key: key.clone(),
                value: ss.id.to_string(),
                ttl: Some(keys::INFLIGHT_TTL),
            })
            .collect();
        let acquired: Vec<bool> = self
            .kv
            .exec(setnx_ops)
            .await?
            .iter()
            .map(|reply| reply.acquired())
            .collect();

        let mut write_ops = Vec::new();
        for (ss, taken) in prepared.iter().zip(&acquired) {
            if *taken {
                write_ops.extend(self.write_ops(ss, encode(ss)?));
            }
        }

        let write_err = match self.kv.exec(write_ops).await {
            Ok(_) => None,
            Err(err) => {
                let rollback: Vec<KvOp> = markers
                    .iter()
                    .zip(&acquired)
                    .filter(|(_, taken)| **taken)
                    .map(|(key, _)| KvOp::Del { key: key.clone() })
                    .collect();
                let _ = self.kv.exec(rollback).await;
                Some(err.to_string())
            }
        };

        Ok(prepared
            .into_iter()
            .zip(acquired)
            .map(|(item, taken)| {
                let outcome = if !taken {
                    EnqueueOutcome::SkippedInflight
                } else if let Some(err) = &write_err {
                    EnqueueOutcome::Failed(err.clone())
                } else {
                    EnqueueOutcome::Enqueued
                };
                EnqueueResult { item, outcome }
            })
            .collect())
    }

    /// Pop, claim, and start one stack-scan, waiting up to `timeout`.
    ///
    /// Pops run in 1 s slices so the caller can cancel promptly by dropping
    /// the future. Missing records and lost claim races skip to the next
    /// pop. Returns `None` on timeout.
    pub async fn dequeue(
        &self,
        worker_id: &WorkerId,
        timeout: Duration,
    ) -> Result<Option<Dequeued>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = POP_SLICE.min(deadline - now);
            let Some(id) = self.kv.brpop(keys::QUEUE_WORKITEMS, slice).await? else {
                continue;
            };

            let Some(mut ss) = self.load(&id).await? else {
                tracing::debug!(id, "popped id without a record, skipping");
                continue;
            };
            // Recovery re-pushes can leave duplicate ids in the list; only a
            // pending record is claimable.
            if ss.status != StackScanStatus::Pending {
                tracing::debug!(id, status = %ss.status, "popped non-pending id, skipping");
                continue;
            }

            if !self
                .kv
                .set_nx(&keys::claim(&id), worker_id.as_str(), Some(keys::CLAIM_TTL))
                .await?
            {
                tracing::debug!(id, "already claimed, skipping");
                continue;
            }

            ss.status = StackScanStatus::Running;
            ss.started_at = self.clock.epoch_ms();
            ss.worker_id = worker_id.clone();
            self.save(&ss).await?;
            self.kv
                .exec(vec![
                    KvOp::SRem {
                        key: keys::PENDING_SET.to_string(),
                        member: id.clone(),
                    },
                    KvOp::ZAdd {
                        key: keys::RUNNING_STACK_SCANS.to_string(),
                        member: id.clone(),
                        score: ss.started_at as f64,
                    },
                ])
                .await?;

            let scan = self
                .scan_delta(&ss, &[(fields::RUNNING, 1), (fields::QUEUED, -1)])
                .await?;
            return Ok(Some(Dequeued { stack_scan: ss, scan }));
        }
    }

    async fn scan_delta(
        &self,
        ss: &StackScan,
        deltas: &[(&str, i64)],
    ) -> Result<Option<TransitionReply>, StoreError> {
        if !ss.is_scan_attached() {
            return Ok(None);
        }
        let req = counter_transition(
            &ss.project,
            ss.scan_id.as_str(),
            self.clock.epoch_ms(),
            deltas,
        );
        let reply = self.kv.transition(req).await?;
        if reply.not_found() {
            // Parent hash expired: nothing to update, surface no snapshot.
            tracing::debug!(scan = %ss.scan_id, "scan hash missing during counter delta");
            return Ok(None);
        }
        Ok(Some(reply))
    }

    /// Finish a stack-scan successfully, recording whether it drifted.
    pub async fn complete(
        &self,
        ss: &mut StackScan,
        drifted: bool,
    ) -> Result<Option<TransitionReply>, StoreError> {
        ss.status = StackScanStatus::Completed;
        ss.completed_at = self.clock.epoch_ms();
        self.save(ss).await?;
        self.kv.exec(self.terminal_ops(ss)).await?;

        let mut deltas = vec![(fields::RUNNING, -1), (fields::COMPLETED, 1)];
        if drifted {
            deltas.push((fields::DRIFTED, 1));
        }
        self.scan_delta(ss, &deltas).await
    }

    /// Record a failure: retry while budget remains, else fail terminally.
    pub async fn fail(
        &self,
        ss: &mut StackScan,
        msg: &str,
    ) -> Result<(FailOutcome, Option<TransitionReply>), StoreError> {
        ss.retries += 1;
        ss.error = msg.to_string();

        if !ss.retries_exhausted() {
            ss.status = StackScanStatus::Pending;
            ss.started_at = 0;
            ss.worker_id = WorkerId::default();
            self.save(ss).await?;
            let id = ss.id.to_string();
            self.kv
                .exec(vec![
                    KvOp::Del {
                        key: keys::claim(&id),
                    },
                    KvOp::SAdd {
                        key: keys::PENDING_SET.to_string(),
                        member: id.clone(),
                    },
                    KvOp::ZRem {
                        key: keys::RUNNING_STACK_SCANS.to_string(),
                        member: id.clone(),
                    },
                    KvOp::LPush {
                        key: keys::QUEUE_WORKITEMS.to_string(),
                        value: id.clone(),
                    },
                ])
                .await?;
            tracing::info!(id, retries = ss.retries, error = msg, "stack-scan requeued");
            let reply = self.scan_delta(ss, &[(fields::RUNNING, -1), (fields::QUEUED, 1)]).await?;
            return Ok((FailOutcome::Requeued, reply));
        }

        ss.status = StackScanStatus::Failed;
        ss.completed_at = self.clock.epoch_ms();
        self.save(ss).await?;
        self.kv.exec(self.terminal_ops(ss)).await?;
        tracing::warn!(id = %ss.id, error = msg, "stack-scan failed");
        let reply = self
            .scan_delta(ss, &[(fields::RUNNING, -1), (fields::FAILED, 1), (fields::ERRORED, 1)])
            .await?;
        Ok((FailOutcome::Exhausted, reply))
    }

    /// Cancel a stack-scan (parent scan canceled or shutdown cascade).
    pub async fn cancel(&self, ss: &mut StackScan) -> Result<(), StoreError> {
        ss.status = StackScanStatus::Canceled;
        ss.completed_at = self.clock.epoch_ms();
        self.save(ss).await?;
        self.kv.exec(self.terminal_ops(ss)).await?;
        tracing::info!(id = %ss.id, "stack-scan canceled");
        Ok(())
    }

    /// Index cleanup shared by every terminal transition.
    fn terminal_ops(&self, ss: &StackScan) -> Vec<KvOp> {
        let id = ss.id.to_string();
        vec![
            KvOp::Del {
                key: keys::claim(&id),
            },
            KvOp::Del {
                key: keys::inflight(&ss.project, &ss.stack_path),
            },
            KvOp::SRem {
                key: keys::PENDING_SET.to_string(),
                member: id.clone(),
            },
            KvOp::ZRem {
                key: keys::RUNNING_STACK_SCANS.to_string(),
                member: id.clone(),
            },
            KvOp::SRem {
                key: keys::project_set(&ss.project),
                member: id.clone(),
            },
            KvOp::ZRem {
                key: keys::project_ordered(&ss.project),
                member: id,
            },
        ]
    }

    // -- recovery --

    /// Re-push pending items that fell out of the queue list (crash between
    /// pipeline and pop, or a popped-but-never-claimed id). Only items that
    /// have sat pending longer than `older_than` are touched, so a healthy
    /// freshly-enqueued backlog is never duplicated. Dangling ids are pruned
    /// from the pending set.
    pub async fn recover_orphans(&self, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = self
            .clock
            .epoch_ms()
            .saturating_sub(older_than.as_millis() as u64);
        let ids = self.kv.sscan(keys::PENDING_SET).await?;
        let mut recovered = 0;
        for id in ids {
            match self.load(&id).await? {
                Some(ss) if ss.status == StackScanStatus::Pending && ss.created_at > cutoff => {}
                Some(ss) if ss.status == StackScanStatus::Pending => {
                    // Reassert the marker, then re-push. A duplicate list
                    // entry is harmless: the claim lock dedups consumers.
                    self.kv
                        .set(
                            &keys::inflight(&ss.project, &ss.stack_path),
                            ss.id.as_str(),
                            Some(keys::INFLIGHT_TTL),
                        )
                        .await?;
                    self.kv.lpush(keys::QUEUE_WORKITEMS, &id).await?;
                    recovered += 1;
                }
                Some(_) => {
                    self.kv.srem(keys::PENDING_SET, &id).await?;
                }
                None => {
                    self.kv.srem(keys::PENDING_SET, &id).await?;
                }
            }
        }
        if recovered > 0 {
            tracing::info!(count = recovered, "requeued orphaned stack-scans");
        }
        Ok(recovered)
    }

    /// Fail running stack-scans older than `max_age` (lost workers). Failed
    /// items retry through the normal budget.
    pub async fn recover_stale(&self, max_age: Duration) -> Result<u64, StoreError> {
        let cutoff = self.clock.epoch_ms().saturating_sub(max_age.as_millis() as u64);
        let ids = self
            .kv
            .zrange_by_score(keys::RUNNING_STACK_SCANS, f64::NEG_INFINITY, cutoff as f64)
            .await?;

        let mut recovered = 0;
        for id in ids {
            match self.load(&id).await? {
                Some(mut ss)
                    if ss.status == StackScanStatus::Running && ss.started_at <= cutoff =>
                {
                    self.fail(&mut ss, "stale stack-scan: worker lost").await?;
                    recovered += 1;
                }
                Some(_) | None => {
                    self.kv.zrem(keys::RUNNING_STACK_SCANS, &id).await?;
                }
            }
        }
        if recovered > 0 {
            tracing::warn!(count = recovered, "recovered stale stack-scans");
        }
        Ok(recovered)
    }

    /// Queue depth (pending pops).
    pub async fn depth(&self) -> Result<u64, StoreError> {
        Ok(self.kv.llen(keys::QUEUE_WORKITEMS).await?)
    }

    /// Running stack-scan count and the age of the oldest one.
    pub async fn running_stats(&self) -> Result<(u64, Duration), StoreError> {
        let count = self.kv.zcard(keys::RUNNING_STACK_SCANS).await?;
        let oldest = self
            .kv
            .zrange_with_scores(keys::RUNNING_STACK_SCANS, 0, 0)
            .await?;
        let age = oldest
            .first()
            .map(|(_, score)| {
                let started = *score as u64;
                Duration::from_millis(self.clock.epoch_ms().saturating_sub(started))
            })
            .unwrap_or(Duration::ZERO);
        Ok((count, age))
    }
}

fn encode(ss: &StackScan) -> Result<String, StoreError> {
    serde_json::to_string(ss).map_err(|err| StoreError::Corrupt {
        key: keys::stack_scan(ss.id.as_str()),
        reason: err.to_string(),
    })
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
