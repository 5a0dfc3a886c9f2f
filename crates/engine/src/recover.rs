// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic background reconciliation: queue orphans, stale stack-scans,
//! stale scans. Runs off the hot path on a fixed interval.

use driftd_core::Clock;
use driftd_kv::KvDriver;
use driftd_store::{Scans, StackScanQueue, StoreError};
use std::time::Duration;
use tokio::sync::watch;

/// Recovery cadence and staleness bounds.
#[derive(Debug, Clone, Copy)]
pub struct RecoverySettings {
    pub interval: Duration,
    /// A pending stack-scan older than this with no queue entry is re-pushed.
    pub orphan_grace: Duration,
    /// A running stack-scan older than this is failed back for retry.
    pub stack_max_age: Duration,
    /// A running scan older than this is failed.
    pub scan_max_age: Duration,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub orphans_requeued: u64,
    pub stale_stack_scans: u64,
    pub stale_scans: u64,
}

/// One reconciliation pass.
pub async fn recover_once<D: KvDriver, C: Clock>(
    queue: &StackScanQueue<D, C>,
    scans: &Scans<D, C>,
    settings: &RecoverySettings,
) -> Result<RecoveryReport, StoreError> {
    Ok(RecoveryReport {
        orphans_requeued: queue.recover_orphans(settings.orphan_grace).await?,
        stale_stack_scans: queue.recover_stale(settings.stack_max_age).await?,
        stale_scans: scans.recover_stale(settings.scan_max_age).await?,
    })
}

/// Reconcile on an interval until shutdown.
pub async fn run_recovery<D: KvDriver, C: Clock>(
    queue: StackScanQueue<D, C>,
    scans: Scans<D, C>,
    settings: RecoverySettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        match recover_once(&queue, &scans, &settings).await {
            Ok(report) if report != RecoveryReport::default() => {
                tracing::info!(
                    orphans = report.orphans_requeued,
                    stale_stack_scans = report.stale_stack_scans,
                    stale_scans = report.stale_scans,
                    "recovery pass"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "recovery pass failed");
            }
        }
    }
}
