// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scan aggregate: one project-level run across all of its stacks.

use crate::clock::Clock;
use crate::trigger::TriggerKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

crate::define_id! {
    /// Unique identifier for a scan, formatted `<project>:<epoch-nanos>`.
    pub struct ScanId;
}

impl ScanId {
    /// Derive a fresh id for a project from the clock.
    pub fn generate(project: &str, clock: &impl Clock) -> Self {
        Self(format!("{}:{}", project, clock.epoch_nanos()))
    }
}

/// Scan lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Canceled => "canceled",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanStatus::Running)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ScanStatus::Running),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            "canceled" => Ok(ScanStatus::Canceled),
            other => Err(FieldError::BadValue {
                field: fields::STATUS,
                value: other.to_string(),
            }),
        }
    }
}

/// Hash field names for the persisted scan record.
///
/// The counter transition primitive reads `STATUS`, `TOTAL`, `COMPLETED`,
/// `FAILED`, `DRIFTED` and writes `STATUS`/`ENDED_AT`, so these literals are
/// part of the storage contract.
pub mod fields {
    pub const ID: &str = "id";
    pub const PROJECT: &str = "project";
    pub const TRIGGER: &str = "trigger";
    pub const COMMIT: &str = "commit";
    pub const ACTOR: &str = "actor";
    pub const COMMIT_SHA: &str = "commit_sha";
    pub const WORKSPACE_PATH: &str = "workspace_path";
    pub const TOOL_VERSIONS: &str = "tool_versions";
    pub const TOOL_OVERRIDES: &str = "tool_overrides";
    pub const STATUS: &str = "status";
    pub const CREATED_AT: &str = "created_at";
    pub const STARTED_AT: &str = "started_at";
    pub const ENDED_AT: &str = "ended_at";
    pub const ERROR: &str = "error";
    pub const TOTAL: &str = "total";
    pub const QUEUED: &str = "queued";
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const DRIFTED: &str = "drifted";
    pub const ERRORED: &str = "errored";
}

/// Inputs for creating a new scan.
#[derive(Debug, Clone, Default)]
pub struct ScanConfig {
    pub project: String,
    pub trigger: Option<TriggerKind>,
    pub commit: String,
    pub actor: String,
    pub commit_sha: String,
    pub workspace_path: String,
    /// Tool name → version for every stack in this scan.
    pub tool_versions: HashMap<String, String>,
    /// Stack path → (tool name → version) overriding `tool_versions`.
    pub tool_overrides: HashMap<String, HashMap<String, String>>,
    /// Number of stack-scans that will be enqueued.
    pub total: i64,
}

/// A scan record, materialized from its KV hash.
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub id: ScanId,
    pub project: String,
    pub trigger: Option<TriggerKind>,
    pub commit: String,
    pub actor: String,
    pub commit_sha: String,
    pub workspace_path: String,
    pub tool_versions: HashMap<String, String>,
    pub tool_overrides: HashMap<String, HashMap<String, String>>,
    pub status: ScanStatus,
    pub created_at: u64,
    pub started_at: u64,
    pub ended_at: u64,
    pub error: String,
    pub total: i64,
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub drifted: i64,
    pub errored: i64,
}

impl Scan {
    /// Create a new running scan with `queued = total` and a fresh id.
    pub fn new(config: ScanConfig, clock: &impl Clock) -> Self {
        let id = ScanId::generate(&config.project, clock);
        let now = clock.epoch_ms();
        Self {
            id,
            project: config.project,
            trigger: config.trigger,
            commit: config.commit,
            actor: config.actor,
            commit_sha: config.commit_sha,
            workspace_path: config.workspace_path,
            tool_versions: config.tool_versions,
            tool_overrides: config.tool_overrides,
            status: ScanStatus::Running,
            created_at: now,
            started_at: now,
            ended_at: 0,
            error: String::new(),
            total: config.total,
            queued: config.total,
            running: 0,
            completed: 0,
            failed: 0,
            drifted: 0,
            errored: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Effective tool versions for one stack path (overrides win).
    pub fn versions_for(&self, stack_path: &str) -> HashMap<String, String> {
        let mut merged = self.tool_versions.clone();
        if let Some(overrides) = self.tool_overrides.get(stack_path) {
            for (tool, version) in overrides {
                merged.insert(tool.clone(), version.clone());
            }
        }
        merged
    }

    /// Flatten to hash field/value pairs for storage.
    ///
    /// JSON-valued fields (`tool_versions`, `tool_overrides`) are omitted
    /// when empty so typical scans stay small.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out = vec![
            (fields::ID.to_string(), self.id.to_string()),
            (fields::PROJECT.to_string(), self.project.clone()),
            (fields::COMMIT.to_string(), self.commit.clone()),
            (fields::ACTOR.to_string(), self.actor.clone()),
            (fields::COMMIT_SHA.to_string(), self.commit_sha.clone()),
            (
                fields::WORKSPACE_PATH.to_string(),
                self.workspace_path.clone(),
            ),
            (fields::STATUS.to_string(), self.status.to_string()),
            (fields::CREATED_AT.to_string(), self.created_at.to_string()),
            (fields::STARTED_AT.to_string(), self.started_at.to_string()),
            (fields::ENDED_AT.to_string(), self.ended_at.to_string()),
            (fields::ERROR.to_string(), self.error.clone()),
            (fields::TOTAL.to_string(), self.total.to_string()),
            (fields::QUEUED.to_string(), self.queued.to_string()),
            (fields::RUNNING.to_string(), self.running.to_string()),
            (fields::COMPLETED.to_string(), self.completed.to_string()),
            (fields::FAILED.to_string(), self.failed.to_string()),
            (fields::DRIFTED.to_string(), self.drifted.to_string()),
            (fields::ERRORED.to_string(), self.errored.to_string()),
        ];
        if let Some(trigger) = self.trigger {
            out.push((fields::TRIGGER.to_string(), trigger.to_string()));
        }
        if !self.tool_versions.is_empty() {
            if let Ok(json) = serde_json::to_string(&self.tool_versions) {
                out.push((fields::TOOL_VERSIONS.to_string(), json));
            }
        }
        if !self.tool_overrides.is_empty() {
            if let Ok(json) = serde_json::to_string(&self.tool_overrides) {
                out.push((fields::TOOL_OVERRIDES.to_string(), json));
            }
        }
        out
    }

    /// Rebuild a scan from its hash fields.
    pub fn from_fields(map: &HashMap<String, String>) -> Result<Self, FieldError> {
        let required = |field: &'static str| -> Result<String, FieldError> {
            map.get(field)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or(FieldError::Missing { field })
        };
        let text = |field: &'static str| map.get(field).cloned().unwrap_or_default();
        let int = |field: &'static str| {
            map.get(field)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
        };
        let uint = |field: &'static str| {
            map.get(field)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };

        let status = required(fields::STATUS)?.parse::<ScanStatus>()?;
        let trigger = map
            .get(fields::TRIGGER)
            .filter(|v| !v.is_empty())
            .and_then(|v| v.parse::<TriggerKind>().ok());
        let tool_versions = map
            .get(fields::TOOL_VERSIONS)
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        let tool_overrides = map
            .get(fields::TOOL_OVERRIDES)
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();

        Ok(Self {
            id: ScanId::new(required(fields::ID)?),
            project: required(fields::PROJECT)?,
            trigger,
            commit: text(fields::COMMIT),
            actor: text(fields::ACTOR),
            commit_sha: text(fields::COMMIT_SHA),
            workspace_path: text(fields::WORKSPACE_PATH),
            tool_versions,
            tool_overrides,
            status,
            created_at: uint(fields::CREATED_AT),
            started_at: uint(fields::STARTED_AT),
            ended_at: uint(fields::ENDED_AT),
            error: text(fields::ERROR),
            total: int(fields::TOTAL),
            queued: int(fields::QUEUED),
            running: int(fields::RUNNING),
            completed: int(fields::COMPLETED),
            failed: int(fields::FAILED),
            drifted: int(fields::DRIFTED),
            errored: int(fields::ERRORED),
        })
    }
}

/// Errors reading a scan record out of its hash representation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("missing scan field: {field}")]
    Missing { field: &'static str },
    #[error("bad scan field {field}: {value}")]
    BadValue { field: &'static str, value: String },
}

#[cfg(test)]
#[path = "scan_tests.rs"]
mod tests;
