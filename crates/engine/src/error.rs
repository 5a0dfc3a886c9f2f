// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for the engine.

use driftd_core::ConfigError;
use driftd_store::StoreError;
use thiserror::Error;

/// Errors from dispatch and worker orchestration.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid worker configuration: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// True for KV transport failures (back off, never fail the scan).
    pub fn is_transport(&self) -> bool {
        matches!(self, EngineError::Store(err) if err.is_transport())
    }
}
