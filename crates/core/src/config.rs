// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker and trigger-policy configuration with validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minimum project-lock TTL (2 minutes).
pub const MIN_LOCK_TTL: Duration = Duration::from_secs(120);

/// Minimum lock-renewal interval (10 seconds).
pub const MIN_RENEW_EVERY: Duration = Duration::from_secs(10);

/// Minimum per-stack execution timeout (1 second).
pub const MIN_STACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Worker-process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of cooperative dequeue loops (≥ 1).
    pub concurrency: usize,
    /// Project-lock TTL (≥ 2 min).
    pub lock_ttl: Duration,
    /// Lock-renewal interval (≥ 10 s, ≤ lock_ttl/2).
    pub renew_every: Duration,
    /// Hard cap on total scan duration.
    pub scan_max_age: Duration,
    /// Hard cap on one stack-scan execution.
    pub stack_timeout: Duration,
    /// Grant dispatched stack-scans one retry.
    pub retry_once: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lock_ttl: Duration::from_secs(300),
            renew_every: Duration::from_secs(60),
            scan_max_age: Duration::from_secs(2 * 60 * 60),
            stack_timeout: Duration::from_secs(30 * 60),
            retry_once: false,
        }
    }
}

impl WorkerConfig {
    /// Enforce the configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Concurrency);
        }
        if self.lock_ttl < MIN_LOCK_TTL {
            return Err(ConfigError::LockTtl {
                got: self.lock_ttl,
                min: MIN_LOCK_TTL,
            });
        }
        if self.renew_every < MIN_RENEW_EVERY {
            return Err(ConfigError::RenewTooShort {
                got: self.renew_every,
                min: MIN_RENEW_EVERY,
            });
        }
        if self.renew_every > self.lock_ttl / 2 {
            return Err(ConfigError::RenewTooLong {
                got: self.renew_every,
                max: self.lock_ttl / 2,
            });
        }
        if self.stack_timeout < MIN_STACK_TIMEOUT {
            return Err(ConfigError::StackTimeout {
                got: self.stack_timeout,
                min: MIN_STACK_TIMEOUT,
            });
        }
        Ok(())
    }

    /// Retry budget granted to dispatched stack-scans.
    pub fn max_retries(&self) -> u32 {
        if self.retry_once {
            1
        } else {
            0
        }
    }
}

/// Per-project trigger policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPolicy {
    /// Supersede an active scan when a new trigger arrives.
    #[serde(default = "default_true")]
    pub cancel_inflight_on_new_trigger: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self {
            cancel_inflight_on_new_trigger: true,
        }
    }
}

/// Configuration bound violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("concurrency must be at least 1")]
    Concurrency,
    #[error("lock_ttl {got:?} below minimum {min:?}")]
    LockTtl { got: Duration, min: Duration },
    #[error("renew_every {got:?} below minimum {min:?}")]
    RenewTooShort { got: Duration, min: Duration },
    #[error("renew_every {got:?} exceeds lock_ttl/2 ({max:?})")]
    RenewTooLong { got: Duration, max: Duration },
    #[error("stack_timeout {got:?} below minimum {min:?}")]
    StackTimeout { got: Duration, min: Duration },
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
