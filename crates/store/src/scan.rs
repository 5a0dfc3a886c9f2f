// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scan aggregate: start, supersede, counter transitions, terminal paths,
//! stale recovery, and the running-index rebuild.
//!
//! The scan hash is mutated only through the atomic counter-transition
//! primitive and the terminal paths below; locks are touched only through
//! CAS. Auto-finish lives inside the transition: the scan flips terminal the
//! moment `completed + failed >= total` (or `total == 0`), releasing the
//! project lock if still owned, repointing the last-scan pointer, and
//! leaving the running index.

use crate::error::StoreError;
use crate::keys;
use crate::lock::Locks;
use driftd_core::scan::{fields, Scan, ScanConfig, ScanId, ScanStatus};
use driftd_core::Clock;
use driftd_kv::{CounterTransition, KvDriver, LockHandoff, TransitionReply};
use std::time::Duration;

/// Build the atomic transition request for one scan.
pub(crate) fn counter_transition(
    project: &str,
    scan_id: &str,
    ended_at_ms: u64,
    deltas: &[(&str, i64)],
) -> CounterTransition {
    CounterTransition {
        hash_key: keys::scan(scan_id),
        deltas: deltas
            .iter()
            .map(|(field, delta)| (field.to_string(), *delta))
            .collect(),
        ended_at_ms,
        unlock_key: keys::project_lock(project),
        unlock_owner: scan_id.to_string(),
        active_key: keys::active_scan(project),
        last_key: keys::last_scan(project),
        last_value: scan_id.to_string(),
        running_zset: keys::RUNNING_SCANS.to_string(),
        member: scan_id.to_string(),
        retention: keys::RETENTION,
    }
}

/// Scan aggregate operations over the shared KV.
#[derive(Clone)]
pub struct Scans<D, C> {
    kv: D,
    clock: C,
    locks: Locks<D>,
    lock_ttl: Duration,
}

impl<D: KvDriver, C: Clock> Scans<D, C> {
    pub fn new(kv: D, clock: C, lock_ttl: Duration) -> Self {
        Self {
            locks: Locks::new(kv.clone()),
            kv,
            clock,
            lock_ttl,
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Start a scan: acquire the project lock with the new scan id as owner,
    /// then write the hash and indices. Fails with `ProjectLocked` when
    /// another scan is active; rolls the lock back if the writes fail.
    pub async fn start(&self, config: ScanConfig) -> Result<Scan, StoreError> {
        let scan = Scan::new(config, &self.clock);
        let lock_key = keys::project_lock(&scan.project);

        if !self
            .locks
            .acquire(&lock_key, scan.id.as_str(), self.lock_ttl)
            .await?
        {
            return Err(StoreError::ProjectLocked(scan.project.clone()));
        }

        if let Err(err) = self.write_new_scan(&scan).await {
            let _ = self.kv.del_if_equals(&lock_key, scan.id.as_str()).await;
            return Err(err);
        }

        tracing::info!(
            scan = %scan.id,
            project = %scan.project,
            total = scan.total,
            "scan started"
        );
        Ok(scan)
    }

    /// Atomically supersede the active scan: guard on the project lock still
    /// holding `old_id`, mark the old scan canceled, and hand the lock to a
    /// fresh scan in the same step. Returns `None` when the guard fails
    /// (the old scan already finished or lost the lock) — callers fall back
    /// to [`Scans::start`].
    pub async fn cancel_and_start(
        &self,
        old_id: &ScanId,
        config: ScanConfig,
    ) -> Result<Option<Scan>, StoreError> {
        let scan = Scan::new(config, &self.clock);
        let handed_off = self
            .kv
            .handoff(LockHandoff {
                lock_key: keys::project_lock(&scan.project),
                old_owner: old_id.to_string(),
                new_owner: scan.id.to_string(),
                lock_ttl: self.lock_ttl,
                old_hash_key: keys::scan(old_id.as_str()),
                ended_at_ms: self.clock.epoch_ms(),
                error: "superseded by new trigger".to_string(),
                running_zset: keys::RUNNING_SCANS.to_string(),
                last_key: keys::last_scan(&scan.project),
                active_key: keys::active_scan(&scan.project),
                retention: keys::RETENTION,
            })
            .await?;
        if !handed_off {
            return Ok(None);
        }

        // Non-atomic follow-up: the lock and pointers already name the new
        // scan, so these writes only fill in the hash and running index.
        self.write_new_scan(&scan).await?;

        tracing::info!(
            scan = %scan.id,
            superseded = %old_id,
            project = %scan.project,
            "scan superseded"
        );
        Ok(Some(scan))
    }

    async fn write_new_scan(&self, scan: &Scan) -> Result<(), StoreError> {
        let scan_key = keys::scan(scan.id.as_str());
        self.kv.hset(&scan_key, &scan.to_fields()).await?;
        self.kv.pexpire(&scan_key, keys::RETENTION).await?;
        self.kv
            .set(&keys::active_scan(&scan.project), scan.id.as_str(), None)
            .await?;
        self.kv
            .zadd(
                keys::RUNNING_SCANS,
                scan.id.as_str(),
                scan.started_at as f64,
                false,
            )
            .await?;
        Ok(())
    }

    /// Fetch a scan by id.
    pub async fn get(&self, id: &ScanId) -> Result<Scan, StoreError> {
        let key = keys::scan(id.as_str());
        let map = self.kv.hgetall(&key).await?;
        if map.is_empty() {
            return Err(StoreError::ScanNotFound(id.to_string()));
        }
        Scan::from_fields(&map).map_err(|err| StoreError::Corrupt {
            key,
            reason: err.to_string(),
        })
    }

    /// The project's active scan, if any. A dangling pointer (hash expired)
    /// is pruned and reported as `None`.
    pub async fn active(&self, project: &str) -> Result<Option<Scan>, StoreError> {
        let pointer = keys::active_scan(project);
        let Some(id) = self.kv.get(&pointer).await? else {
            return Ok(None);
        };
        match self.get(&ScanId::new(id.clone())).await {
            Ok(scan) => Ok(Some(scan)),
            Err(StoreError::ScanNotFound(_)) => {
                let _ = self.kv.del_if_equals(&pointer, &id).await;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// The project's most recently finished scan, if any.
    pub async fn last(&self, project: &str) -> Result<Option<Scan>, StoreError> {
        let Some(id) = self.kv.get(&keys::last_scan(project)).await? else {
            return Ok(None);
        };
        match self.get(&ScanId::new(id)).await {
            Ok(scan) => Ok(Some(scan)),
            Err(StoreError::ScanNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Child stack-scan ids of a scan.
    pub async fn children(&self, id: &ScanId) -> Result<Vec<String>, StoreError> {
        Ok(self.kv.smembers(&keys::scan_children(id.as_str())).await?)
    }

    /// Reassert the project lock for a still-running scan.
    pub async fn renew_lock(&self, scan: &Scan) -> Result<(), StoreError> {
        self.locks
            .renew(
                &keys::project_lock(&scan.project),
                scan.id.as_str(),
                self.lock_ttl,
            )
            .await
    }

    // -- counter transitions --

    async fn transition(
        &self,
        project: &str,
        scan_id: &ScanId,
        deltas: &[(&str, i64)],
    ) -> Result<TransitionReply, StoreError> {
        let req = counter_transition(project, scan_id.as_str(), self.clock.epoch_ms(), deltas);
        let reply = self.kv.transition(req).await?;
        if reply.not_found() {
            return Err(StoreError::ScanNotFound(scan_id.to_string()));
        }
        Ok(reply)
    }

    /// A stack-scan left the queue and started running.
    pub async fn mark_running(
        &self,
        project: &str,
        scan_id: &ScanId,
    ) -> Result<TransitionReply, StoreError> {
        self.transition(project, scan_id, &[(fields::RUNNING, 1), (fields::QUEUED, -1)])
            .await
    }

    /// A failed stack-scan went back to the queue for another attempt.
    pub async fn mark_retry(
        &self,
        project: &str,
        scan_id: &ScanId,
    ) -> Result<TransitionReply, StoreError> {
        self.transition(project, scan_id, &[(fields::RUNNING, -1), (fields::QUEUED, 1)])
            .await
    }

    /// A stack-scan finished cleanly.
    pub async fn mark_completed(
        &self,
        project: &str,
        scan_id: &ScanId,
        drifted: bool,
    ) -> Result<TransitionReply, StoreError> {
        let mut deltas = vec![(fields::RUNNING, -1), (fields::COMPLETED, 1)];
        if drifted {
            deltas.push((fields::DRIFTED, 1));
        }
        self.transition(project, scan_id, &deltas).await
    }

    /// A stack-scan exhausted its retries.
    pub async fn mark_failed(
        &self,
        project: &str,
        scan_id: &ScanId,
    ) -> Result<TransitionReply, StoreError> {
        self.transition(
            project,
            scan_id,
            &[(fields::RUNNING, -1), (fields::FAILED, 1), (fields::ERRORED, 1)],
        )
        .await
    }

    /// Enqueueing a stack-scan failed outright.
    pub async fn mark_enqueue_failed(
        &self,
        project: &str,
        scan_id: &ScanId,
    ) -> Result<TransitionReply, StoreError> {
        self.transition(
            project,
            scan_id,
            &[(fields::QUEUED, -1), (fields::FAILED, 1), (fields::ERRORED, 1)],
        )
        .await
    }

    /// A stack was filtered out after the scan total was set.
    pub async fn mark_enqueue_skipped(
        &self,
        project: &str,
        scan_id: &ScanId,
    ) -> Result<TransitionReply, StoreError> {
        self.transition(project, scan_id, &[(fields::QUEUED, -1), (fields::TOTAL, -1)])
            .await
    }

    // -- terminal paths --

    /// Cancel a running scan. Idempotent on terminal scans.
    pub async fn cancel(&self, id: &ScanId, reason: &str) -> Result<Scan, StoreError> {
        self.finish(id, ScanStatus::Canceled, reason).await
    }

    /// Fail a running scan. Idempotent on terminal scans.
    pub async fn fail(&self, id: &ScanId, error: &str) -> Result<Scan, StoreError> {
        self.finish(id, ScanStatus::Failed, error).await
    }

    async fn finish(
        &self,
        id: &ScanId,
        status: ScanStatus,
        error: &str,
    ) -> Result<Scan, StoreError> {
        let mut scan = self.get(id).await?;
        if scan.is_terminal() {
            return Ok(scan);
        }
        let now = self.clock.epoch_ms();
        scan.status = status;
        scan.ended_at = now;
        scan.error = error.to_string();

        let scan_key = keys::scan(id.as_str());
        self.kv
            .hset(
                &scan_key,
                &[
                    (fields::STATUS.to_string(), status.to_string()),
                    (fields::ENDED_AT.to_string(), now.to_string()),
                    (fields::ERROR.to_string(), error.to_string()),
                ],
            )
            .await?;
        self.kv.pexpire(&scan_key, keys::RETENTION).await?;
        self.kv.zrem(keys::RUNNING_SCANS, id.as_str()).await?;
        // Pointer and lock leave only if this scan still owns them.
        self.kv
            .del_if_equals(&keys::active_scan(&scan.project), id.as_str())
            .await?;
        self.kv
            .set(
                &keys::last_scan(&scan.project),
                id.as_str(),
                Some(keys::RETENTION),
            )
            .await?;
        self.kv
            .del_if_equals(&keys::project_lock(&scan.project), id.as_str())
            .await?;

        tracing::info!(scan = %id, status = %status, error, "scan finished");
        Ok(scan)
    }

    // -- recovery --

    /// Fail every scan that has been running longer than `max_age`.
    pub async fn recover_stale(&self, max_age: Duration) -> Result<u64, StoreError> {
        let cutoff = self.clock.epoch_ms().saturating_sub(max_age.as_millis() as u64);
        let ids = self
            .kv
            .zrange_by_score(keys::RUNNING_SCANS, f64::NEG_INFINITY, cutoff as f64)
            .await?;

        let mut failed = 0;
        for id in ids {
            let scan_id = ScanId::new(id.clone());
            match self.get(&scan_id).await {
                Ok(scan)
                    if scan.status == ScanStatus::Running && scan.started_at <= cutoff =>
                {
                    self.fail(&scan_id, "exceeded maximum duration").await?;
                    failed += 1;
                }
                Ok(_) | Err(StoreError::ScanNotFound(_)) => {
                    // Record finished elsewhere or expired: drop the index entry.
                    self.kv.zrem(keys::RUNNING_SCANS, &id).await?;
                }
                Err(err) => return Err(err),
            }
        }
        if failed > 0 {
            tracing::warn!(count = failed, "failed stale scans");
        }
        Ok(failed)
    }

    /// Rebuild the running-scans index from the scan hashes (startup path).
    /// `ZADD NX` keeps it idempotent against concurrent instances.
    pub async fn rebuild_running_index(&self) -> Result<u64, StoreError> {
        let keys_found = self.kv.scan_keys(keys::SCAN_HASH_PATTERN).await?;
        let mut added = 0;
        for key in keys_found {
            if !keys::is_scan_hash_key(&key) {
                continue;
            }
            let map = self.kv.hgetall(&key).await?;
            if map.is_empty() {
                continue;
            }
            let Ok(scan) = Scan::from_fields(&map) else {
                tracing::warn!(key, "skipping undecodable scan hash during rebuild");
                continue;
            };
            if scan.status == ScanStatus::Running && scan.started_at > 0 {
                if self
                    .kv
                    .zadd(
                        keys::RUNNING_SCANS,
                        scan.id.as_str(),
                        scan.started_at as f64,
                        true,
                    )
                    .await?
                {
                    added += 1;
                }
            }
        }
        tracing::info!(added, "rebuilt running-scans index");
        Ok(added)
    }
}

#[cfg(test)]
#[path = "scan_tests.rs"]
mod tests;
