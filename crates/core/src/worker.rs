// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker identifier.

crate::define_id! {
    /// Unique identifier for a worker dequeue loop.
    ///
    /// Claim locks and running stack-scans are tagged with this id so stale
    /// work can be traced back to its consumer.
    pub struct WorkerId;
}
