// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Clock abstraction so time-dependent logic is testable.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time.
///
/// All timestamps in the system are epoch milliseconds; scan ids embed epoch
/// nanoseconds for uniqueness within a project.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn epoch_ms(&self) -> u64;

    /// Nanoseconds since the Unix epoch.
    fn epoch_nanos(&self) -> u64;
}

/// Real wall-clock time.
#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn epoch_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Manually-advanced clock for tests.
#[derive(Clone)]
pub struct FakeClock {
    now_ms: Arc<Mutex<u64>>,
}

impl FakeClock {
    /// Create a clock starting at an arbitrary non-zero instant.
    pub fn new() -> Self {
        Self::at(1_700_000_000_000)
    }

    /// Create a clock starting at `ms` since the epoch.
    pub fn at(ms: u64) -> Self {
        Self {
            now_ms: Arc::new(Mutex::new(ms)),
        }
    }

    /// Advance the clock by `ms` milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        *self.now_ms.lock() += ms;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn epoch_ms(&self) -> u64 {
        *self.now_ms.lock()
    }

    fn epoch_nanos(&self) -> u64 {
        *self.now_ms.lock() * 1_000_000
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
