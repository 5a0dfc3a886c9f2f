// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Trigger sources for scans.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What caused a scan to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Periodic schedule (cron).
    Scheduled,
    /// Explicit user request.
    Manual,
    /// Repository webhook.
    Webhook,
    /// Re-check after an apply.
    #[serde(rename = "post-apply")]
    PostApply,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Manual => "manual",
            TriggerKind::Webhook => "webhook",
            TriggerKind::PostApply => "post-apply",
        }
    }

    /// Dispatch priority: scheduled triggers rank below everything else.
    ///
    /// Priority never reorders the FIFO work queue; the dispatcher consults
    /// it when deciding whether a new trigger may supersede an active scan.
    pub fn priority(&self) -> u8 {
        match self {
            TriggerKind::Scheduled => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = UnknownTrigger;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" | "cron" => Ok(TriggerKind::Scheduled),
            "manual" => Ok(TriggerKind::Manual),
            "webhook" => Ok(TriggerKind::Webhook),
            "post-apply" => Ok(TriggerKind::PostApply),
            other => Err(UnknownTrigger(other.to_string())),
        }
    }
}

/// Error for unrecognized trigger strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown trigger kind: {0}")]
pub struct UnknownTrigger(pub String);

#[cfg(test)]
#[path = "trigger_tests.rs"]
mod tests;
