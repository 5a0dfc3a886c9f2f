// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Atomic compound primitives.
//!
//! The two sequences that must be linearizable — the counter transition with
//! auto-finish, and the guarded lock handoff — run as a single server-side
//! Lua script on Redis. A driver without scripting must provide an
//! equivalent single-roundtrip primitive (the in-memory driver runs them
//! under one mutex).
//!
//! Both primitives operate on a "finishable counter hash": a hash with a
//! `status` field (`running` until terminal), integer counter fields, and an
//! `ended_at` field. The field and status literals below are part of the
//! storage contract.

use std::time::Duration;

pub const FIELD_STATUS: &str = "status";
pub const FIELD_TOTAL: &str = "total";
pub const FIELD_COMPLETED: &str = "completed";
pub const FIELD_FAILED: &str = "failed";
pub const FIELD_DRIFTED: &str = "drifted";
pub const FIELD_ENDED_AT: &str = "ended_at";

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_CANCELED: &str = "canceled";

/// Apply floored counter deltas to a hash and finish it when every unit of
/// work has resolved.
///
/// Semantics, in one atomic step:
/// 1. For each `(field, delta)`: `HINCRBY`, then reset the field to 0 if the
///    result went negative.
/// 2. Read `status`, `total`, `completed`, `failed`, `drifted`.
/// 3. If `status == "running"` and (`total == 0` or
///    `completed + failed >= total`): flip `status` to `failed` (when
///    `failed > 0`) or `completed`, stamp `ended_at`, CAS-delete
///    `unlock_key` when it still holds `unlock_owner`, delete `active_key`,
///    write `last_key = last_value` with the retention TTL, and remove
///    `member` from `running_zset`.
/// 4. Refresh the hash retention TTL.
///
/// The reply is the post-transition tuple, so callers can publish state
/// without a second read. A missing hash yields an empty `status`.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterTransition {
    pub hash_key: String,
    pub deltas: Vec<(String, i64)>,
    /// Stamped into `ended_at` if this transition finishes the hash.
    pub ended_at_ms: u64,
    pub unlock_key: String,
    pub unlock_owner: String,
    pub active_key: String,
    pub last_key: String,
    pub last_value: String,
    pub running_zset: String,
    pub member: String,
    pub retention: Duration,
}

/// Post-transition snapshot returned by [`CounterTransition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionReply {
    /// Post-transition status; empty when the hash does not exist.
    pub status: String,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
    pub drifted: i64,
    /// Zero while still running.
    pub ended_at_ms: u64,
}

impl TransitionReply {
    /// True when the hash was missing (stale reference or TTL expiry).
    pub fn not_found(&self) -> bool {
        self.status.is_empty()
    }

    /// True when this transition (or an earlier one) finished the hash.
    pub fn is_terminal(&self) -> bool {
        !self.not_found() && self.status != STATUS_RUNNING
    }
}

/// Atomically supersede the owner of a lock.
///
/// Guard: the lock must still hold `old_owner`, else nothing happens and the
/// reply is `false`. On success, in the same atomic step: the old counter
/// hash is marked canceled (`status`, `ended_at`, `error`) with its retention
/// refreshed, the old owner leaves `running_zset`, `last_key` is set to the
/// old owner with the retention TTL, the lock is overwritten with
/// `new_owner` under `lock_ttl`, and `active_key` is repointed at the new
/// owner.
#[derive(Debug, Clone, PartialEq)]
pub struct LockHandoff {
    pub lock_key: String,
    pub old_owner: String,
    pub new_owner: String,
    pub lock_ttl: Duration,
    /// Counter hash of the superseded owner.
    pub old_hash_key: String,
    pub ended_at_ms: u64,
    pub error: String,
    pub running_zset: String,
    pub last_key: String,
    pub active_key: String,
    pub retention: Duration,
}

/// Lua: `GET == owner ? DEL : noop`.
pub(crate) const DEL_IF_EQUALS_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Lua: `GET == owner ? PEXPIRE : noop`.
pub(crate) const PEXPIRE_IF_EQUALS_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Lua for [`CounterTransition`].
///
/// KEYS: hash, unlock, active, last, running zset.
/// ARGV: ended_at, unlock_owner, last_value, member, retention_ms,
/// delta count, then (field, delta) pairs.
pub(crate) const TRANSITION_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {'', '0', '0', '0', '0', '0'}
end
local n = tonumber(ARGV[6])
for i = 0, n - 1 do
  local field = ARGV[7 + i * 2]
  local delta = tonumber(ARGV[8 + i * 2])
  local v = redis.call('HINCRBY', KEYS[1], field, delta)
  if v < 0 then
    redis.call('HSET', KEYS[1], field, 0)
  end
end
local vals = redis.call('HMGET', KEYS[1], 'status', 'total', 'completed', 'failed', 'drifted', 'ended_at')
local status = vals[1] or ''
local total = tonumber(vals[2]) or 0
local completed = tonumber(vals[3]) or 0
local failed = tonumber(vals[4]) or 0
local drifted = tonumber(vals[5]) or 0
local ended = tonumber(vals[6]) or 0
if status == 'running' and (total == 0 or completed + failed >= total) then
  if failed > 0 then
    status = 'failed'
  else
    status = 'completed'
  end
  ended = tonumber(ARGV[1])
  redis.call('HSET', KEYS[1], 'status', status, 'ended_at', ended)
  if redis.call('GET', KEYS[2]) == ARGV[2] then
    redis.call('DEL', KEYS[2])
  end
  redis.call('DEL', KEYS[3])
  redis.call('SET', KEYS[4], ARGV[3], 'PX', ARGV[5])
  redis.call('ZREM', KEYS[5], ARGV[4])
end
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return {status, tostring(completed), tostring(failed), tostring(total), tostring(drifted), tostring(ended)}
"#;

/// Lua for [`LockHandoff`].
///
/// KEYS: lock, old hash, running zset, last, active.
/// ARGV: old_owner, new_owner, lock_ttl_ms, ended_at, error, retention_ms.
pub(crate) const HANDOFF_LUA: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[2], 'status', 'canceled', 'ended_at', ARGV[4], 'error', ARGV[5])
redis.call('PEXPIRE', KEYS[2], ARGV[6])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('SET', KEYS[4], ARGV[1], 'PX', ARGV[6])
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
redis.call('SET', KEYS[5], ARGV[2])
return 1
"#;
