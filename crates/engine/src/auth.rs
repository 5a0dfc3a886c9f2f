// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Git auth resolution seam.
//!
//! Real deployments plug a provider backed by their credentials store; the
//! worker only needs credentials when it has to materialize a workspace
//! itself.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Credentials for fetching a repository.
#[derive(Clone, PartialEq, Eq)]
pub struct GitAuth {
    pub username: String,
    pub token: String,
}

impl fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Token stays out of logs.
        f.debug_struct("GitAuth")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Errors from auth resolution.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth resolution failed: {0}")]
    Failed(String),
}

/// Resolves credentials for a clone URL.
#[async_trait]
pub trait AuthProvider: Clone + Send + Sync + 'static {
    /// Credentials for the URL, or `None` for anonymous access.
    async fn resolve(&self, project_url: &str) -> Result<Option<GitAuth>, AuthError>;
}

/// Provider for deployments where workspaces are pre-materialized or
/// repositories are public.
#[derive(Clone, Copy, Default)]
pub struct NoAuthProvider;

#[async_trait]
impl AuthProvider for NoAuthProvider {
    async fn resolve(&self, _project_url: &str) -> Result<Option<GitAuth>, AuthError> {
        Ok(None)
    }
}
