// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plan runner seam.
//!
//! The orchestrator never interprets plan output — it only looks at
//! [`RunResult::drifted`] and [`RunResult::error`]. A non-empty `error`
//! means the plan itself failed; an `Err` from [`Runner::run`] means the
//! attempt failed before a plan verdict existed (transport, I/O).

use crate::auth::GitAuth;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

/// Inputs for one plan invocation.
#[derive(Debug, Clone)]
pub struct RunParams {
    /// The stack-scan id, for correlation.
    pub run_id: String,
    pub project: String,
    pub project_url: String,
    pub stack_path: String,
    /// Tool name → version for this stack.
    pub tool_versions: HashMap<String, String>,
    pub commit_sha: String,
    /// Pre-materialized workspace root; empty when the runner must fetch.
    pub workspace_path: String,
    pub clone_depth: u32,
    pub auth: Option<GitAuth>,
    /// Remove per-stack artifacts after the run.
    pub cleanup: bool,
}

/// Outcome of one plan invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub drifted: bool,
    pub added: u64,
    pub changed: u64,
    pub destroyed: u64,
    pub plan_output: String,
    /// Non-empty means the plan failed.
    pub error: String,
    /// Epoch millis when the plan ran.
    pub run_at: u64,
}

impl RunResult {
    /// A clean plan with no changes.
    pub fn clean() -> Self {
        Self::default()
    }

    /// A drifted plan with the given change counts.
    pub fn with_drift(added: u64, changed: u64, destroyed: u64) -> Self {
        Self {
            drifted: true,
            added,
            changed,
            destroyed,
            ..Self::default()
        }
    }

    /// A plan failure.
    pub fn plan_error(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            ..Self::default()
        }
    }
}

/// Errors raised before a plan verdict exists.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner failed: {0}")]
    Failed(String),
}

/// Executes one plan for one stack. Must be reentrant: every worker loop in
/// the process shares one runner.
#[async_trait]
pub trait Runner: Clone + Send + Sync + 'static {
    async fn run(&self, params: RunParams) -> Result<RunResult, RunnerError>;

    /// Remove artifacts scoped to the workspace stack directory after a run.
    /// Default is a no-op.
    async fn cleanup(&self, _params: &RunParams) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// Runner that shells out to a plan-capable tool in the stack directory.
///
/// The command runs with the stack directory as its working directory and is
/// expected to follow the detailed-exitcode convention: 0 = clean,
/// 2 = changes pending (drift), anything else = plan failure. Tool versions
/// are exported as `DRIFTD_TOOL_<NAME>` for version-manager shims.
#[derive(Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Runner for CommandRunner {
    async fn run(&self, params: RunParams) -> Result<RunResult, RunnerError> {
        if params.workspace_path.is_empty() {
            return Ok(RunResult::plan_error("no workspace materialized"));
        }
        let cwd = Path::new(&params.workspace_path).join(&params.stack_path);
        let run_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (tool, version) in &params.tool_versions {
            cmd.env(
                format!("DRIFTD_TOOL_{}", tool.to_uppercase().replace('-', "_")),
                version,
            );
        }

        let output = cmd
            .output()
            .await
            .map_err(|err| RunnerError::Failed(format!("spawn {}: {}", self.program, err)))?;

        let plan_output = String::from_utf8_lossy(&output.stdout).into_owned();
        let result = match output.status.code() {
            Some(0) => RunResult {
                plan_output,
                run_at,
                ..RunResult::clean()
            },
            Some(2) => RunResult {
                plan_output,
                run_at,
                ..RunResult::with_drift(0, 0, 0)
            },
            code => RunResult {
                plan_output,
                run_at,
                error: format!(
                    "plan exited with {:?}: {}",
                    code,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                ..RunResult::default()
            },
        };
        Ok(result)
    }
}

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    //! Fake runner for testing.
    #![cfg_attr(coverage_nightly, coverage(off))]

    use super::{RunParams, RunResult, Runner, RunnerError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::time::Duration;

    /// Scripted outcome for one invocation.
    #[derive(Debug, Clone)]
    pub enum FakeOutcome {
        Result(RunResult),
        /// Transport-level failure (no plan verdict).
        Error(String),
    }

    #[derive(Default)]
    struct FakeRunnerState {
        by_stack: HashMap<String, VecDeque<FakeOutcome>>,
        calls: Vec<RunParams>,
        cleanups: Vec<RunParams>,
        delay: Option<Duration>,
    }

    /// Fake runner with scripted per-stack outcomes and recorded calls.
    /// Stacks without a script complete clean.
    #[derive(Clone, Default)]
    pub struct FakeRunner {
        inner: Arc<Mutex<FakeRunnerState>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a result for the next invocation on `stack_path`.
        pub fn push_result(&self, stack_path: &str, result: RunResult) {
            self.inner
                .lock()
                .by_stack
                .entry(stack_path.to_string())
                .or_default()
                .push_back(FakeOutcome::Result(result));
        }

        /// Queue a transport error for the next invocation on `stack_path`.
        pub fn push_error(&self, stack_path: &str, msg: &str) {
            self.inner
                .lock()
                .by_stack
                .entry(stack_path.to_string())
                .or_default()
                .push_back(FakeOutcome::Error(msg.to_string()));
        }

        /// Delay every invocation (for watchdog/timeout tests).
        pub fn set_delay(&self, delay: Duration) {
            self.inner.lock().delay = Some(delay);
        }

        /// All recorded invocations.
        pub fn calls(&self) -> Vec<RunParams> {
            self.inner.lock().calls.clone()
        }

        /// All recorded cleanup calls.
        pub fn cleanups(&self) -> Vec<RunParams> {
            self.inner.lock().cleanups.clone()
        }
    }

    #[async_trait]
    impl Runner for FakeRunner {
        async fn run(&self, params: RunParams) -> Result<RunResult, RunnerError> {
            let (outcome, delay) = {
                let mut state = self.inner.lock();
                state.calls.push(params.clone());
                let outcome = state
                    .by_stack
                    .get_mut(&params.stack_path)
                    .and_then(VecDeque::pop_front);
                (outcome, state.delay)
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match outcome {
                Some(FakeOutcome::Result(result)) => Ok(result),
                Some(FakeOutcome::Error(msg)) => Err(RunnerError::Failed(msg)),
                None => Ok(RunResult::clean()),
            }
        }

        async fn cleanup(&self, params: &RunParams) -> Result<(), RunnerError> {
            self.inner.lock().cleanups.push(params.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
