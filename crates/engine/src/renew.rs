// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Project-lock renewal for active scans.
//!
//! The renewal task reasserts the owner-tagged lock on an interval and
//! enforces the hard cap on scan duration. It exits as soon as the scan is
//! no longer running, ownership is lost, or shutdown is requested; losing
//! ownership is logged at warn and never escalated.

use driftd_core::scan::{ScanId, ScanStatus};
use driftd_core::Clock;
use driftd_kv::KvDriver;
use driftd_store::{EventPublisher, Scans, StoreError};
use std::time::Duration;
use tokio::sync::watch;

/// Renewal cadence and the scan-age hard cap.
#[derive(Debug, Clone, Copy)]
pub struct RenewSettings {
    pub renew_every: Duration,
    pub scan_max_age: Duration,
}

/// Keep the project lock alive while `scan_id` runs.
pub async fn renew_scan_lock<D: KvDriver, C: Clock>(
    scans: Scans<D, C>,
    publisher: EventPublisher<D, C>,
    clock: C,
    scan_id: ScanId,
    settings: RenewSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(settings.renew_every);
    // The first tick completes immediately; the lock was just acquired.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }

        let scan = match scans.get(&scan_id).await {
            Ok(scan) => scan,
            Err(StoreError::ScanNotFound(_)) => return,
            Err(err) => {
                tracing::warn!(scan = %scan_id, error = %err, "renewal fetch failed, retrying");
                continue;
            }
        };
        if scan.status != ScanStatus::Running {
            return;
        }

        let age = Duration::from_millis(clock.epoch_ms().saturating_sub(scan.started_at));
        if age > settings.scan_max_age {
            tracing::warn!(scan = %scan_id, age_ms = age.as_millis() as u64, "scan exceeded maximum duration");
            match scans.fail(&scan_id, "exceeded maximum duration").await {
                Ok(failed) => {
                    publisher.publish(&publisher.scan_update_full(&failed)).await;
                }
                Err(err) => {
                    tracing::warn!(scan = %scan_id, error = %err, "failed to fail over-age scan");
                }
            }
            return;
        }

        match scans.renew_lock(&scan).await {
            Ok(()) => {
                tracing::debug!(scan = %scan_id, "project lock renewed");
            }
            Err(StoreError::LockNotOwned(_)) => {
                tracing::warn!(scan = %scan_id, "project lock no longer ours, stopping renewal");
                return;
            }
            Err(err) => {
                tracing::warn!(scan = %scan_id, error = %err, "lock renewal failed, retrying");
            }
        }
    }
}

#[cfg(test)]
#[path = "renew_tests.rs"]
mod tests;
