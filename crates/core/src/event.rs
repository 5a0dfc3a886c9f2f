// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire events published on the per-project pub/sub channel.
//!
//! Serializes with `{"type": "scan_update" | "stack_update", ...fields}`.
//! Events carry the post-transition state; delivery is best-effort, so
//! subscribers must stay idempotent and fall back to polling authoritative
//! state.

use serde::{Deserialize, Serialize};

/// A state-transition notification for a scan or one of its stack-scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScanEvent {
    #[serde(rename = "scan_update")]
    ScanUpdate {
        project: String,
        #[serde(rename = "scanID")]
        scan_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
        #[serde(default, rename = "startedAt", skip_serializing_if = "Option::is_none")]
        started_at: Option<u64>,
        #[serde(default, rename = "endedAt", skip_serializing_if = "Option::is_none")]
        ended_at: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completed: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        drifted_count: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: u64,
    },

    #[serde(rename = "stack_update")]
    StackUpdate {
        project: String,
        #[serde(rename = "scanID")]
        scan_id: String,
        #[serde(rename = "stackPath")]
        stack_path: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        drifted: Option<bool>,
        #[serde(default, rename = "runAt", skip_serializing_if = "Option::is_none")]
        run_at: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: u64,
    },
}

impl ScanEvent {
    /// Project the event belongs to (selects the pub/sub channel).
    pub fn project(&self) -> &str {
        match self {
            ScanEvent::ScanUpdate { project, .. } => project,
            ScanEvent::StackUpdate { project, .. } => project,
        }
    }

    pub fn scan_id(&self) -> &str {
        match self {
            ScanEvent::ScanUpdate { scan_id, .. } => scan_id,
            ScanEvent::StackUpdate { scan_id, .. } => scan_id,
        }
    }

    pub fn status(&self) -> &str {
        match self {
            ScanEvent::ScanUpdate { status, .. } => status,
            ScanEvent::StackUpdate { status, .. } => status,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            ScanEvent::ScanUpdate { timestamp, .. } => *timestamp,
            ScanEvent::StackUpdate { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
