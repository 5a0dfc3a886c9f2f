// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stack-scan work item: one plan for one stack directory.

use crate::clock::Clock;
use crate::scan::ScanId;
use crate::worker::WorkerId;
use serde::{Deserialize, Serialize};
use std::fmt;

crate::define_id! {
    /// Unique identifier for a stack-scan, formatted
    /// `<project>:<stack-path>:<epoch-nanos>:<nonce>`.
    pub struct StackScanId;
}

/// Stack-scan lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl StackScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackScanStatus::Pending => "pending",
            StackScanStatus::Running => "running",
            StackScanStatus::Completed => "completed",
            StackScanStatus::Failed => "failed",
            StackScanStatus::Canceled => "canceled",
        }
    }

    /// Pending and running items hold the inflight marker.
    pub fn is_inflight(&self) -> bool {
        matches!(self, StackScanStatus::Pending | StackScanStatus::Running)
    }
}

impl fmt::Display for StackScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs for creating a new stack-scan.
#[derive(Debug, Clone, Default)]
pub struct StackScanConfig {
    /// Parent scan, or empty for a standalone item.
    pub scan_id: ScanId,
    pub project: String,
    pub project_url: String,
    pub stack_path: String,
    pub max_retries: u32,
}

/// A stack-scan work item, persisted as a JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackScan {
    /// Assigned on enqueue when empty.
    #[serde(default)]
    pub id: StackScanId,
    /// Parent scan id; empty for standalone items.
    #[serde(default)]
    pub scan_id: ScanId,
    pub project: String,
    #[serde(default)]
    pub project_url: String,
    pub stack_path: String,
    pub status: StackScanStatus,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub started_at: u64,
    #[serde(default)]
    pub completed_at: u64,
    #[serde(default)]
    pub worker_id: WorkerId,
    #[serde(default)]
    pub error: String,
}

impl StackScan {
    /// Create a pending stack-scan with an unassigned id.
    pub fn new(config: StackScanConfig, clock: &impl Clock) -> Self {
        Self {
            id: StackScanId::default(),
            scan_id: config.scan_id,
            project: config.project,
            project_url: config.project_url,
            stack_path: config.stack_path,
            status: StackScanStatus::Pending,
            retries: 0,
            max_retries: config.max_retries,
            created_at: clock.epoch_ms(),
            started_at: 0,
            completed_at: 0,
            worker_id: WorkerId::default(),
            error: String::new(),
        }
    }

    /// True when this item belongs to a scan aggregate.
    pub fn is_scan_attached(&self) -> bool {
        !self.scan_id.is_empty()
    }

    /// True once the retry budget is exhausted.
    pub fn retries_exhausted(&self) -> bool {
        self.retries > self.max_retries
    }
}

#[cfg(test)]
#[path = "stack_scan_tests.rs"]
mod tests;
