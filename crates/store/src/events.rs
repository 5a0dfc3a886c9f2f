// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Best-effort event publishing to the per-project channel.

use crate::keys;
use driftd_core::stack_scan::StackScan;
use driftd_core::{Clock, Scan, ScanEvent};
use driftd_kv::{KvDriver, TransitionReply};

/// Publishes typed scan/stack events; failures are logged and swallowed —
/// subscribers fall back to polling authoritative state.
#[derive(Clone)]
pub struct EventPublisher<D, C> {
    kv: D,
    clock: C,
}

impl<D: KvDriver, C: Clock> EventPublisher<D, C> {
    pub fn new(kv: D, clock: C) -> Self {
        Self { kv, clock }
    }

    /// Fire-and-forget publish.
    pub async fn publish(&self, event: &ScanEvent) {
        let channel = keys::events_channel(event.project());
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode event");
                return;
            }
        };
        if let Err(err) = self.kv.publish(&channel, &payload).await {
            tracing::warn!(channel, error = %err, "failed to publish event");
        }
    }

    /// Scan update from a post-transition counter snapshot.
    pub fn scan_update(&self, project: &str, scan_id: &str, reply: &TransitionReply) -> ScanEvent {
        ScanEvent::ScanUpdate {
            project: project.to_string(),
            scan_id: scan_id.to_string(),
            status: reply.status.clone(),
            commit: None,
            started_at: None,
            ended_at: (reply.ended_at_ms > 0).then_some(reply.ended_at_ms),
            completed: Some(reply.completed),
            failed: Some(reply.failed),
            total: Some(reply.total),
            drifted_count: Some(reply.drifted),
            error: None,
            timestamp: self.clock.epoch_ms(),
        }
    }

    /// Scan update from a full scan record (start/cancel/fail paths).
    pub fn scan_update_full(&self, scan: &Scan) -> ScanEvent {
        ScanEvent::ScanUpdate {
            project: scan.project.clone(),
            scan_id: scan.id.to_string(),
            status: scan.status.to_string(),
            commit: (!scan.commit.is_empty()).then(|| scan.commit.clone()),
            started_at: (scan.started_at > 0).then_some(scan.started_at),
            ended_at: (scan.ended_at > 0).then_some(scan.ended_at),
            completed: Some(scan.completed),
            failed: Some(scan.failed),
            total: Some(scan.total),
            drifted_count: Some(scan.drifted),
            error: (!scan.error.is_empty()).then(|| scan.error.clone()),
            timestamp: self.clock.epoch_ms(),
        }
    }

    /// Stack update carrying the given post-transition status.
    pub fn stack_update(
        &self,
        ss: &StackScan,
        status: &str,
        drifted: Option<bool>,
        error: Option<String>,
    ) -> ScanEvent {
        ScanEvent::StackUpdate {
            project: ss.project.clone(),
            scan_id: ss.scan_id.to_string(),
            stack_path: ss.stack_path.clone(),
            status: status.to_string(),
            drifted,
            run_at: (ss.started_at > 0).then_some(ss.started_at),
            error,
            timestamp: self.clock.epoch_ms(),
        }
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
