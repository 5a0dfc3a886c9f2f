// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event-driven metrics with periodic gauge polling.
//!
//! The collector subscribes to `events:*` and folds transitions into
//! per-project counters. A state table keyed by scan id (and
//! `scanID|stackPath` for stack events) makes replayed or duplicated events
//! no-ops, so counts converge to the authoritative state no matter how the
//! best-effort stream behaves. Queue depth and running-age gauges come from
//! bounded polls, not events.

use driftd_core::{Clock, ScanEvent};
use driftd_kv::KvDriver;
use driftd_store::{keys, StackScanQueue, StoreError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Bound on each gauge poll.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Backoff before re-subscribing after the event stream drops.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(5);

/// Stack-scan duration histogram bounds (seconds).
const DURATION_BOUNDS: [u64; 8] = [1, 5, 15, 30, 60, 120, 300, 600];

/// Fixed-bucket duration histogram.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DurationHistogram {
    /// One count per bound, plus an overflow bucket.
    pub buckets: Vec<u64>,
    pub count: u64,
    pub sum_ms: u64,
}

impl DurationHistogram {
    fn observe(&mut self, duration_ms: u64) {
        if self.buckets.is_empty() {
            self.buckets = vec![0; DURATION_BOUNDS.len() + 1];
        }
        let secs = duration_ms / 1_000;
        let idx = DURATION_BOUNDS
            .iter()
            .position(|bound| secs <= *bound)
            .unwrap_or(DURATION_BOUNDS.len());
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum_ms += duration_ms;
    }
}

/// Per-project counters and gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectMetrics {
    pub active_scans: i64,
    pub scans_completed: u64,
    pub scans_failed: u64,
    pub scans_canceled: u64,
    pub stack_scans_completed: u64,
    pub stack_scans_failed: u64,
    pub stack_scans_drifted: u64,
    pub stack_scan_duration: DurationHistogram,
}

/// Point-in-time view of everything the collector tracks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub projects: HashMap<String, ProjectMetrics>,
    pub queue_depth: u64,
    pub running_stack_scans: u64,
    pub oldest_running_age_ms: u64,
    pub running_scans: u64,
}

#[derive(Default)]
struct MetricsState {
    /// scanID → last observed status.
    scan_status: HashMap<String, String>,
    /// scanID|stackPath → last observed status.
    stack_status: HashMap<String, String>,
    /// scanID|stackPath → run start timestamp.
    stack_started: HashMap<String, u64>,
    projects: HashMap<String, ProjectMetrics>,
    queue_depth: u64,
    running_stack_scans: u64,
    oldest_running_age_ms: u64,
    running_scans: u64,
}

fn is_terminal(status: &str) -> bool {
    matches!(status, "completed" | "failed" | "canceled")
}

/// Subscribes to the event stream and polls queue gauges.
#[derive(Clone)]
pub struct MetricsCollector<D, C> {
    kv: D,
    queue: StackScanQueue<D, C>,
    state: Arc<Mutex<MetricsState>>,
}

impl<D: KvDriver, C: Clock> MetricsCollector<D, C> {
    pub fn new(kv: D, clock: C) -> Self {
        Self {
            queue: StackScanQueue::new(kv.clone(), clock),
            kv,
            state: Arc::new(Mutex::new(MetricsState::default())),
        }
    }

    /// Fold one event into the counters. Replays of an already-observed
    /// status are no-ops.
    pub fn apply_event(&self, event: &ScanEvent) {
        let mut state = self.state.lock();
        match event {
            ScanEvent::ScanUpdate {
                project,
                scan_id,
                status,
                ..
            } => {
                let prev = state.scan_status.get(scan_id).cloned();
                if prev.as_deref() == Some(status.as_str()) {
                    return;
                }
                // Terminal is final: replayed pre-terminal events are stale.
                if prev.as_deref().is_some_and(is_terminal) {
                    return;
                }
                state.scan_status.insert(scan_id.clone(), status.clone());
                let metrics = state.projects.entry(project.clone()).or_default();
                match status.as_str() {
                    "running" if prev.is_none() => metrics.active_scans += 1,
                    s if is_terminal(s) => {
                        if prev.is_some() {
                            metrics.active_scans = (metrics.active_scans - 1).max(0);
                        }
                        match s {
                            "completed" => metrics.scans_completed += 1,
                            "failed" => metrics.scans_failed += 1,
                            _ => metrics.scans_canceled += 1,
                        }
                    }
                    _ => {}
                }
            }
            ScanEvent::StackUpdate {
                project,
                scan_id,
                stack_path,
                status,
                drifted,
                run_at,
                timestamp,
                ..
            } => {
                let key = format!("{scan_id}|{stack_path}");
                let prev = state.stack_status.insert(key.clone(), status.clone());
                if prev.as_deref() == Some(status.as_str()) {
                    return;
                }
                if status == "running" {
                    state
                        .stack_started
                        .insert(key, run_at.unwrap_or(*timestamp));
                    return;
                }
                let started = state.stack_started.get(&key).copied();
                let metrics = state.projects.entry(project.clone()).or_default();
                match status.as_str() {
                    "completed" => {
                        metrics.stack_scans_completed += 1;
                        if *drifted == Some(true) {
                            metrics.stack_scans_drifted += 1;
                        }
                        if let Some(started) = started {
                            metrics
                                .stack_scan_duration
                                .observe(timestamp.saturating_sub(started));
                        }
                    }
                    "failed" => metrics.stack_scans_failed += 1,
                    _ => {}
                }
            }
        }
    }

    /// Refresh the poll-driven gauges, each bounded by a 1 s timeout.
    pub async fn poll_once(&self) -> Result<(), StoreError> {
        let depth = tokio::time::timeout(POLL_TIMEOUT, self.queue.depth())
            .await
            .map_err(|_| timeout_error("queue depth"))??;
        let (running, oldest_age) = tokio::time::timeout(POLL_TIMEOUT, self.queue.running_stats())
            .await
            .map_err(|_| timeout_error("running stats"))??;
        let running_scans =
            tokio::time::timeout(POLL_TIMEOUT, self.kv.zcard(keys::RUNNING_SCANS))
                .await
                .map_err(|_| timeout_error("running scans"))??;

        let mut state = self.state.lock();
        state.queue_depth = depth;
        state.running_stack_scans = running;
        state.oldest_running_age_ms = oldest_age.as_millis() as u64;
        state.running_scans = running_scans;
        Ok(())
    }

    /// Current counters and gauges.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        MetricsSnapshot {
            projects: state.projects.clone(),
            queue_depth: state.queue_depth,
            running_stack_scans: state.running_stack_scans,
            oldest_running_age_ms: state.oldest_running_age_ms,
            running_scans: state.running_scans,
        }
    }

    /// Consume the event stream and poll gauges until shutdown.
    pub async fn run(&self, poll_every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(poll_every);
        let mut subscription = None;
        loop {
            if subscription.is_none() {
                match self.kv.psubscribe("events:*").await {
                    Ok(sub) => subscription = Some(sub),
                    Err(err) => {
                        tracing::warn!(error = %err, "metrics subscription failed, retrying");
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => continue,
                        }
                    }
                }
            }
            let Some(sub) = subscription.as_mut() else {
                continue;
            };
            tokio::select! {
                _ = shutdown.changed() => return,
                message = sub.recv() => {
                    match message {
                        Some(message) => {
                            match serde_json::from_str::<ScanEvent>(&message.payload) {
                                Ok(event) => self.apply_event(&event),
                                Err(err) => {
                                    tracing::debug!(error = %err, "undecodable event payload");
                                }
                            }
                        }
                        None => {
                            tracing::warn!("metrics event stream closed, resubscribing");
                            subscription = None;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        tracing::debug!(error = %err, "metrics poll failed");
                    }
                }
            }
        }
    }
}

fn timeout_error(what: &str) -> StoreError {
    StoreError::Kv(driftd_kv::KvError::Transport(format!(
        "{what} poll timed out"
    )))
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
