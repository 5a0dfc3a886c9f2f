// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Key schema and retention constants.
//!
//! All keys the orchestrator writes live here so the namespace can be read
//! in one place. Stack paths inside inflight keys are encoded with `/`
//! replaced by `__`; the encoding is canonical and never decoded — the path
//! always travels inside the stack-scan record itself.

use sha2::{Digest, Sha256};
use std::time::Duration;

/// Retention for scan and stack-scan records (7 days after last write).
pub const RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Inflight dedup markers live as long as the records they guard.
pub const INFLIGHT_TTL: Duration = RETENTION;

/// Claim locks protect a popped id for 30 minutes.
pub const CLAIM_TTL: Duration = Duration::from_secs(30 * 60);

/// FIFO list of stack-scan ids.
pub const QUEUE_WORKITEMS: &str = "queue:workitems";

/// Set of pending stack-scan ids, for orphan recovery.
pub const PENDING_SET: &str = "stack_scans:pending";

/// Running stack-scans, sorted by `started_at`.
pub const RUNNING_STACK_SCANS: &str = "stack_scans:running";

/// Running scans, sorted by `started_at`.
pub const RUNNING_SCANS: &str = "scan:running";

/// Stack-scan JSON blob.
pub fn stack_scan(id: &str) -> String {
    format!("stack_scan:{id}")
}

/// Canonical stack-path encoding for inflight keys.
pub fn encode_stack_path(path: &str) -> String {
    path.replace('/', "__")
}

/// Dedup marker for one (project, stack) pair.
pub fn inflight(project: &str, stack_path: &str) -> String {
    format!(
        "stack_scan:inflight:{}:{}",
        project,
        encode_stack_path(stack_path)
    )
}

/// Per-project set of stack-scan ids.
pub fn project_set(project: &str) -> String {
    format!("stack_scans:project:{project}")
}

/// Per-project sorted set of stack-scan ids by `created_at`.
pub fn project_ordered(project: &str) -> String {
    format!("stack_scans:project:ordered:{project}")
}

/// Claim lock held by the worker processing a popped id.
pub fn claim(stack_scan_id: &str) -> String {
    format!("claim:{stack_scan_id}")
}

/// Scan hash.
pub fn scan(id: &str) -> String {
    format!("scan:{id}")
}

/// Active-scan pointer for a project.
pub fn active_scan(project: &str) -> String {
    format!("scan:project:{project}")
}

/// Last-scan pointer for a project.
pub fn last_scan(project: &str) -> String {
    format!("scan:last:{project}")
}

/// Set of child stack-scan ids for a scan.
pub fn scan_children(scan_id: &str) -> String {
    format!("scan:stack_scans:{scan_id}")
}

/// Project lock; value is the owner scan id.
pub fn project_lock(project: &str) -> String {
    format!("lock:project:{project}")
}

/// Clone lock; value is an owner token, keyed by the URL hash.
pub fn clone_lock(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    format!("lock:clone:{:x}", digest)
}

/// Per-project pub/sub channel.
pub fn events_channel(project: &str) -> String {
    format!("events:{project}")
}

/// SCAN pattern covering scan hashes (plus the pointer keys, which
/// [`is_scan_hash_key`] filters back out).
pub const SCAN_HASH_PATTERN: &str = "scan:*";

/// True when a key from [`SCAN_HASH_PATTERN`] is an actual scan hash rather
/// than one of the pointer/index keys sharing the prefix.
pub fn is_scan_hash_key(key: &str) -> bool {
    key.starts_with("scan:")
        && key != RUNNING_SCANS
        && !key.starts_with("scan:project:")
        && !key.starts_with("scan:last:")
        && !key.starts_with("scan:stack_scans:")
}

/// Scan id embedded in a scan hash key.
pub fn scan_id_of(key: &str) -> Option<&str> {
    key.strip_prefix("scan:")
}

#[cfg(test)]
#[path = "keys_tests.rs"]
mod tests;
