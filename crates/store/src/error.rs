// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for store operations.

use driftd_kv::KvError;
use thiserror::Error;

/// Errors from the queue, scan, and lock state machines.
#[derive(Debug, Error)]
pub enum StoreError {
    /// StartScan while another scan holds the project lock.
    #[error("project is locked: {0}")]
    ProjectLocked(String),
    /// Stale reference or TTL expiry.
    #[error("scan not found: {0}")]
    ScanNotFound(String),
    /// Stale reference or TTL expiry.
    #[error("stack scan not found: {0}")]
    StackScanNotFound(String),
    /// CAS mismatch on renew/release; callers on the renewal path log at
    /// warn and move on.
    #[error("lock not owned: {0}")]
    LockNotOwned(String),
    /// Dedup fired: a pending or running stack-scan already exists for this
    /// (project, stack) pair.
    #[error("stack scan already inflight for {project}:{stack_path}")]
    AlreadyInflight { project: String, stack_path: String },
    /// Another worker claimed the popped id first.
    #[error("stack scan already claimed: {0}")]
    AlreadyClaimed(String),
    /// A persisted record failed to decode.
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error(transparent)]
    Kv(#[from] KvError),
}

impl StoreError {
    /// True for KV transport failures, which must never fail a scan.
    pub fn is_transport(&self) -> bool {
        matches!(self, StoreError::Kv(_))
    }
}
