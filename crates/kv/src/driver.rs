// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The KV driver contract.

use crate::atomic::{CounterTransition, LockHandoff, TransitionReply};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from KV operations.
#[derive(Debug, Error)]
pub enum KvError {
    /// The store is unreachable or the connection broke mid-operation.
    #[error("kv transport error: {0}")]
    Transport(String),
    /// The store answered with something the driver cannot interpret.
    #[error("unexpected kv reply: {0}")]
    UnexpectedReply(String),
    #[error("kv ping timed out after {0:?}")]
    PingTimeout(Duration),
}

/// One message from a pub/sub subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvMessage {
    pub channel: String,
    pub payload: String,
}

/// A live pattern subscription; dropped subscriptions unsubscribe.
pub struct Subscription {
    rx: mpsc::Receiver<KvMessage>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<KvMessage>) -> Self {
        Self { rx }
    }

    /// Wait for the next message; `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<KvMessage> {
        self.rx.recv().await
    }
}

/// One write in a pipelined batch.
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    SetNx {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    ZRem {
        key: String,
        member: String,
    },
    LPush {
        key: String,
        value: String,
    },
    PExpire {
        key: String,
        ttl: Duration,
    },
}

/// Per-op result of a pipelined batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvReply {
    Ok,
    /// SETNX outcome.
    Bool(bool),
    /// Affected-count style replies.
    Int(i64),
}

impl KvReply {
    /// Interpret the reply as a SETNX-style acquisition outcome.
    pub fn acquired(&self) -> bool {
        match self {
            KvReply::Bool(b) => *b,
            KvReply::Int(n) => *n > 0,
            KvReply::Ok => true,
        }
    }
}

/// Thin contract over a Redis-like KV store.
///
/// Implementations must be cheaply cloneable handles; clones share the
/// underlying connection state.
#[async_trait]
pub trait KvDriver: Clone + Send + Sync + 'static {
    /// Round-trip health check bounded by `timeout`.
    async fn ping(&self, timeout: Duration) -> Result<(), KvError>;

    // -- strings --
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;
    /// SET NX; returns true when the key was absent and is now set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<bool, KvError>;
    async fn del(&self, key: &str) -> Result<bool, KvError>;
    async fn exists(&self, key: &str) -> Result<bool, KvError>;
    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;
    /// Remaining TTL; `None` when the key is missing or has no expiry.
    async fn pttl(&self, key: &str) -> Result<Option<Duration>, KvError>;

    // -- hashes --
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError>;
    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, KvError>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, KvError>;

    // -- sets --
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError>;
    /// Full SSCAN sweep (cursored on Redis; prefer over SMEMBERS for
    /// unbounded sets on recovery paths).
    async fn sscan(&self, key: &str) -> Result<Vec<String>, KvError>;

    // -- sorted sets --
    /// ZADD; with `nx` the score of an existing member is left untouched.
    async fn zadd(&self, key: &str, member: &str, score: f64, nx: bool) -> Result<bool, KvError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError>;
    async fn zcard(&self, key: &str) -> Result<u64, KvError>;
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64)
        -> Result<Vec<String>, KvError>;
    async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, KvError>;
    async fn zrevrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, KvError>;

    // -- lists --
    async fn lpush(&self, key: &str, value: &str) -> Result<u64, KvError>;
    /// Blocking right-pop bounded by `timeout`; `None` on timeout.
    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, KvError>;
    async fn llen(&self, key: &str) -> Result<u64, KvError>;

    // -- keyspace --
    /// Cursored SCAN over keys matching a glob pattern.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    // -- pub/sub --
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError>;
    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, KvError>;

    // -- pipelines --
    /// Execute a batch of writes in one roundtrip; replies align with ops.
    async fn exec(&self, ops: Vec<KvOp>) -> Result<Vec<KvReply>, KvError>;

    // -- atomic compound primitives --
    /// DEL only if the current value equals `expected` (CAS release).
    async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError>;
    /// PEXPIRE only if the current value equals `expected` (CAS renew).
    async fn pexpire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, KvError>;
    /// Floored counter deltas plus auto-finish on a counter hash; see
    /// [`CounterTransition`].
    async fn transition(&self, req: CounterTransition) -> Result<TransitionReply, KvError>;
    /// Guarded owner-lock handoff; see [`LockHandoff`].
    async fn handoff(&self, req: LockHandoff) -> Result<bool, KvError>;
}
