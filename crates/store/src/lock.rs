// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Owner-tagged distributed locks.
//!
//! Every mutation goes through a compare-and-swap against the owner token,
//! so a holder whose TTL lapsed can never release or renew a lock that now
//! belongs to someone else.

use crate::error::StoreError;
use driftd_kv::KvDriver;
use std::time::Duration;

/// CAS lock operations over the shared KV.
#[derive(Clone)]
pub struct Locks<D> {
    kv: D,
}

impl<D: KvDriver> Locks<D> {
    pub fn new(kv: D) -> Self {
        Self { kv }
    }

    /// Set-if-absent with TTL. Returns whether the lock was acquired.
    /// Never blocks.
    pub async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        Ok(self.kv.set_nx(key, owner, Some(ttl)).await?)
    }

    /// Refresh the TTL, but only while `owner` still holds the lock.
    pub async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<(), StoreError> {
        if self.kv.pexpire_if_equals(key, owner, ttl).await? {
            Ok(())
        } else {
            Err(StoreError::LockNotOwned(key.to_string()))
        }
    }

    /// Delete the lock, but only while `owner` still holds it.
    pub async fn release(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        if self.kv.del_if_equals(key, owner).await? {
            Ok(())
        } else {
            Err(StoreError::LockNotOwned(key.to_string()))
        }
    }

    /// Current owner, if any.
    pub async fn owner(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.kv.get(key).await?)
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
