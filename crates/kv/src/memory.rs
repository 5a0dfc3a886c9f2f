// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory KV driver for tests.
//!
//! Implements the full driver contract — TTL expiry, blocking pops, pattern
//! pub/sub, pipelines, and the atomic compound primitives — under a single
//! mutex, so every "script" is observably atomic just like on Redis.
#![cfg_attr(coverage_nightly, coverage(off))]

use crate::atomic::{
    CounterTransition, LockHandoff, TransitionReply, FIELD_COMPLETED, FIELD_DRIFTED,
    FIELD_ENDED_AT, FIELD_FAILED, FIELD_STATUS, FIELD_TOTAL, STATUS_CANCELED, STATUS_COMPLETED,
    STATUS_FAILED, STATUS_RUNNING,
};
use crate::driver::{KvDriver, KvError, KvMessage, KvOp, KvReply, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How often a blocked pop re-checks its list.
const POP_POLL: Duration = Duration::from_millis(10);

struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn live(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

struct Subscriber {
    pattern: String,
    tx: mpsc::Sender<KvMessage>,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, Entry<String>>,
    hashes: HashMap<String, Entry<HashMap<String, String>>>,
    sets: HashMap<String, Entry<HashSet<String>>>,
    zsets: HashMap<String, Entry<HashMap<String, f64>>>,
    lists: HashMap<String, Entry<VecDeque<String>>>,
    subscribers: Vec<Subscriber>,
}

impl State {
    fn string(&mut self, key: &str) -> Option<&Entry<String>> {
        purge(&mut self.strings, key);
        self.strings.get(key)
    }

    fn purge_all(&mut self, key: &str) {
        purge(&mut self.strings, key);
        purge(&mut self.hashes, key);
        purge(&mut self.sets, key);
        purge(&mut self.zsets, key);
        purge(&mut self.lists, key);
    }

    fn apply(&mut self, op: &KvOp) -> KvReply {
        match op {
            KvOp::Set { key, value, ttl } => {
                self.strings.insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        expires_at: ttl.map(|t| Instant::now() + t),
                    },
                );
                KvReply::Ok
            }
            KvOp::SetNx { key, value, ttl } => {
                purge(&mut self.strings, key);
                if self.strings.contains_key(key) {
                    KvReply::Bool(false)
                } else {
                    self.strings.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            expires_at: ttl.map(|t| Instant::now() + t),
                        },
                    );
                    KvReply::Bool(true)
                }
            }
            KvOp::Del { key } => {
                let mut n: i64 = 0;
                if self.strings.remove(key).is_some() {
                    n += 1;
                }
                if self.hashes.remove(key).is_some() {
                    n += 1;
                }
                if self.sets.remove(key).is_some() {
                    n += 1;
                }
                if self.zsets.remove(key).is_some() {
                    n += 1;
                }
                if self.lists.remove(key).is_some() {
                    n += 1;
                }
                KvReply::Int(n.min(1))
            }
            KvOp::HSet { key, fields } => {
                purge(&mut self.hashes, key);
                let entry = self
                    .hashes
                    .entry(key.clone())
                    .or_insert_with(|| Entry::live(HashMap::new()));
                for (field, value) in fields {
                    entry.value.insert(field.clone(), value.clone());
                }
                KvReply::Ok
            }
            KvOp::SAdd { key, member } => {
                purge(&mut self.sets, key);
                let entry = self
                    .sets
                    .entry(key.clone())
                    .or_insert_with(|| Entry::live(HashSet::new()));
                KvReply::Int(entry.value.insert(member.clone()) as i64)
            }
            KvOp::SRem { key, member } => {
                purge(&mut self.sets, key);
                let removed = self
                    .sets
                    .get_mut(key)
                    .map(|e| e.value.remove(member))
                    .unwrap_or(false);
                KvReply::Int(removed as i64)
            }
            KvOp::ZAdd { key, member, score } => {
                purge(&mut self.zsets, key);
                let entry = self
                    .zsets
                    .entry(key.clone())
                    .or_insert_with(|| Entry::live(HashMap::new()));
                let added = entry.value.insert(member.clone(), *score).is_none();
                KvReply::Int(added as i64)
            }
            KvOp::ZRem { key, member } => {
                purge(&mut self.zsets, key);
                let removed = self
                    .zsets
                    .get_mut(key)
                    .map(|e| e.value.remove(member).is_some())
                    .unwrap_or(false);
                KvReply::Int(removed as i64)
            }
            KvOp::LPush { key, value } => {
                purge(&mut self.lists, key);
                let entry = self
                    .lists
                    .entry(key.clone())
                    .or_insert_with(|| Entry::live(VecDeque::new()));
                entry.value.push_front(value.clone());
                KvReply::Int(entry.value.len() as i64)
            }
            KvOp::PExpire { key, ttl } => {
                let deadline = Instant::now() + *ttl;
                let mut n = 0;
                if let Some(e) = self.strings.get_mut(key) {
                    e.expires_at = Some(deadline);
                    n = 1;
                }
                if let Some(e) = self.hashes.get_mut(key) {
                    e.expires_at = Some(deadline);
                    n = 1;
                }
                if let Some(e) = self.sets.get_mut(key) {
                    e.expires_at = Some(deadline);
                    n = 1;
                }
                if let Some(e) = self.zsets.get_mut(key) {
                    e.expires_at = Some(deadline);
                    n = 1;
                }
                if let Some(e) = self.lists.get_mut(key) {
                    e.expires_at = Some(deadline);
                    n = 1;
                }
                KvReply::Int(n)
            }
        }
    }
}

fn purge<T>(map: &mut HashMap<String, Entry<T>>, key: &str) {
    if map.get(key).is_some_and(Entry::expired) {
        map.remove(key);
    }
}

/// Glob match supporting `*` (any run) and `?` (any one character).
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    // Iterative wildcard match with single backtrack point.
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// In-memory KV driver.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<State>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a key out-of-band, bypassing CAS (for lock-lapse tests).
    pub fn force_del(&self, key: &str) {
        let mut state = self.state.lock();
        state.strings.remove(key);
        state.hashes.remove(key);
        state.sets.remove(key);
        state.zsets.remove(key);
        state.lists.remove(key);
    }

    fn try_pop(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock();
        purge(&mut state.lists, key);
        state.lists.get_mut(key).and_then(|e| e.value.pop_back())
    }
}

#[async_trait]
impl KvDriver for MemoryDriver {
    async fn ping(&self, _timeout: Duration) -> Result<(), KvError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut state = self.state.lock();
        Ok(state.string(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut state = self.state.lock();
        state.apply(&KvOp::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        });
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut state = self.state.lock();
        let reply = state.apply(&KvOp::SetNx {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        });
        Ok(reply.acquired())
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut state = self.state.lock();
        state.purge_all(key);
        let reply = state.apply(&KvOp::Del {
            key: key.to_string(),
        });
        Ok(matches!(reply, KvReply::Int(n) if n > 0))
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut state = self.state.lock();
        state.purge_all(key);
        Ok(state.strings.contains_key(key)
            || state.hashes.contains_key(key)
            || state.sets.contains_key(key)
            || state.zsets.contains_key(key)
            || state.lists.contains_key(key))
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut state = self.state.lock();
        state.purge_all(key);
        let reply = state.apply(&KvOp::PExpire {
            key: key.to_string(),
            ttl,
        });
        Ok(matches!(reply, KvReply::Int(n) if n > 0))
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let mut state = self.state.lock();
        state.purge_all(key);
        let expiry = state
            .strings
            .get(key)
            .and_then(|e| e.expires_at)
            .or_else(|| state.hashes.get(key).and_then(|e| e.expires_at))
            .or_else(|| state.sets.get(key).and_then(|e| e.expires_at))
            .or_else(|| state.zsets.get(key).and_then(|e| e.expires_at))
            .or_else(|| state.lists.get(key).and_then(|e| e.expires_at));
        Ok(expiry.map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError> {
        let mut state = self.state.lock();
        state.apply(&KvOp::HSet {
            key: key.to_string(),
            fields: fields.to_vec(),
        });
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let mut state = self.state.lock();
        purge(&mut state.hashes, key);
        Ok(state
            .hashes
            .get(key)
            .and_then(|e| e.value.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut state = self.state.lock();
        purge(&mut state.hashes, key);
        Ok(state
            .hashes
            .get(key)
            .map(|e| e.value.clone())
            .unwrap_or_default())
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, KvError> {
        let mut state = self.state.lock();
        purge(&mut state.hashes, key);
        let hash = state.hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|e| e.value.get(*f).cloned()))
            .collect())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, KvError> {
        let mut state = self.state.lock();
        purge(&mut state.hashes, key);
        let entry = state
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Entry::live(HashMap::new()));
        let current = entry
            .value
            .get(field)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        entry.value.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut state = self.state.lock();
        let reply = state.apply(&KvOp::SAdd {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(matches!(reply, KvReply::Int(n) if n > 0))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut state = self.state.lock();
        let reply = state.apply(&KvOp::SRem {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(matches!(reply, KvReply::Int(n) if n > 0))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut state = self.state.lock();
        purge(&mut state.sets, key);
        Ok(state
            .sets
            .get(key)
            .map(|e| e.value.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sscan(&self, key: &str) -> Result<Vec<String>, KvError> {
        self.smembers(key).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64, nx: bool) -> Result<bool, KvError> {
        let mut state = self.state.lock();
        purge(&mut state.zsets, key);
        let entry = state
            .zsets
            .entry(key.to_string())
            .or_insert_with(|| Entry::live(HashMap::new()));
        if nx && entry.value.contains_key(member) {
            return Ok(false);
        }
        Ok(entry.value.insert(member.to_string(), score).is_none())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut state = self.state.lock();
        let reply = state.apply(&KvOp::ZRem {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(matches!(reply, KvReply::Int(n) if n > 0))
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        let mut state = self.state.lock();
        purge(&mut state.zsets, key);
        Ok(state.zsets.get(key).map(|e| e.value.len() as u64).unwrap_or(0))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, KvError> {
        let mut members = self.zrange_sorted(key);
        members.retain(|(_, score)| *score >= min && *score <= max);
        Ok(members.into_iter().map(|(m, _)| m).collect())
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, KvError> {
        let members = self.zrange_sorted(key);
        Ok(slice_range(&members, start, stop))
    }

    async fn zrevrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, KvError> {
        let mut members = self.zrange_sorted(key);
        members.reverse();
        Ok(slice_range(&members, start, stop)
            .into_iter()
            .map(|(m, _)| m)
            .collect())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64, KvError> {
        let mut state = self.state.lock();
        let reply = state.apply(&KvOp::LPush {
            key: key.to_string(),
            value: value.to_string(),
        });
        match reply {
            KvReply::Int(n) => Ok(n as u64),
            _ => Ok(0),
        }
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, KvError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(value) = self.try_pop(key) {
                return Ok(Some(value));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL.min(deadline - now)).await;
        }
    }

    async fn llen(&self, key: &str) -> Result<u64, KvError> {
        let mut state = self.state.lock();
        purge(&mut state.lists, key);
        Ok(state.lists.get(key).map(|e| e.value.len() as u64).unwrap_or(0))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .strings
            .keys()
            .chain(state.hashes.keys())
            .chain(state.sets.keys())
            .chain(state.zsets.keys())
            .chain(state.lists.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError> {
        let targets: Vec<mpsc::Sender<KvMessage>> = {
            let mut state = self.state.lock();
            state.subscribers.retain(|s| !s.tx.is_closed());
            state
                .subscribers
                .iter()
                .filter(|s| glob_match(&s.pattern, channel))
                .map(|s| s.tx.clone())
                .collect()
        };
        for tx in targets {
            // Best-effort: drop on a full buffer, like a lapsed subscriber.
            let _ = tx.try_send(KvMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, KvError> {
        let (tx, rx) = mpsc::channel(256);
        self.state.lock().subscribers.push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });
        Ok(Subscription::new(rx))
    }

    async fn exec(&self, ops: Vec<KvOp>) -> Result<Vec<KvReply>, KvError> {
        let mut state = self.state.lock();
        Ok(ops.iter().map(|op| state.apply(op)).collect())
    }

    async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut state = self.state.lock();
        if state.string(key).map(|e| e.value.as_str()) == Some(expected) {
            state.strings.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn pexpire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut state = self.state.lock();
        if state.string(key).map(|e| e.value.as_str()) == Some(expected) {
            if let Some(entry) = state.strings.get_mut(key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn transition(&self, req: CounterTransition) -> Result<TransitionReply, KvError> {
        let mut state = self.state.lock();
        purge(&mut state.hashes, &req.hash_key);
        if !state.hashes.contains_key(&req.hash_key) {
            return Ok(TransitionReply {
                status: String::new(),
                completed: 0,
                failed: 0,
                total: 0,
                drifted: 0,
                ended_at_ms: 0,
            });
        }

        let int_field = |hash: &HashMap<String, String>, field: &str| {
            hash.get(field).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0)
        };

        if let Some(entry) = state.hashes.get_mut(&req.hash_key) {
            for (field, delta) in &req.deltas {
                let next = (int_field(&entry.value, field) + delta).max(0);
                entry.value.insert(field.clone(), next.to_string());
            }
        }

        let (mut status, total, completed, failed, drifted, mut ended) = {
            let hash = &state
                .hashes
                .get(&req.hash_key)
                .map(|e| e.value.clone())
                .unwrap_or_default();
            (
                hash.get(FIELD_STATUS).cloned().unwrap_or_default(),
                int_field(hash, FIELD_TOTAL),
                int_field(hash, FIELD_COMPLETED),
                int_field(hash, FIELD_FAILED),
                int_field(hash, FIELD_DRIFTED),
                int_field(hash, FIELD_ENDED_AT).max(0) as u64,
            )
        };

        if status == STATUS_RUNNING && (total == 0 || completed + failed >= total) {
            status = if failed > 0 {
                STATUS_FAILED.to_string()
            } else {
                STATUS_COMPLETED.to_string()
            };
            ended = req.ended_at_ms;
            if let Some(entry) = state.hashes.get_mut(&req.hash_key) {
                entry.value.insert(FIELD_STATUS.to_string(), status.clone());
                entry
                    .value
                    .insert(FIELD_ENDED_AT.to_string(), ended.to_string());
            }
            if state.string(&req.unlock_key).map(|e| e.value.as_str())
                == Some(req.unlock_owner.as_str())
            {
                state.strings.remove(&req.unlock_key);
            }
            state.strings.remove(&req.active_key);
            state.strings.insert(
                req.last_key.clone(),
                Entry {
                    value: req.last_value.clone(),
                    expires_at: Some(Instant::now() + req.retention),
                },
            );
            if let Some(zset) = state.zsets.get_mut(&req.running_zset) {
                zset.value.remove(&req.member);
            }
        }

        if let Some(entry) = state.hashes.get_mut(&req.hash_key) {
            entry.expires_at = Some(Instant::now() + req.retention);
        }

        Ok(TransitionReply {
            status,
            completed,
            failed,
            total,
            drifted,
            ended_at_ms: ended,
        })
    }

    async fn handoff(&self, req: LockHandoff) -> Result<bool, KvError> {
        let mut state = self.state.lock();
        if state.string(&req.lock_key).map(|e| e.value.as_str()) != Some(req.old_owner.as_str()) {
            return Ok(false);
        }

        purge(&mut state.hashes, &req.old_hash_key);
        let entry = state
            .hashes
            .entry(req.old_hash_key.clone())
            .or_insert_with(|| Entry::live(HashMap::new()));
        entry
            .value
            .insert(FIELD_STATUS.to_string(), STATUS_CANCELED.to_string());
        entry
            .value
            .insert(FIELD_ENDED_AT.to_string(), req.ended_at_ms.to_string());
        entry.value.insert("error".to_string(), req.error.clone());
        entry.expires_at = Some(Instant::now() + req.retention);

        if let Some(zset) = state.zsets.get_mut(&req.running_zset) {
            zset.value.remove(&req.old_owner);
        }
        state.strings.insert(
            req.last_key.clone(),
            Entry {
                value: req.old_owner.clone(),
                expires_at: Some(Instant::now() + req.retention),
            },
        );
        state.strings.insert(
            req.lock_key.clone(),
            Entry {
                value: req.new_owner.clone(),
                expires_at: Some(Instant::now() + req.lock_ttl),
            },
        );
        state
            .strings
            .insert(req.active_key.clone(), Entry::live(req.new_owner.clone()));
        Ok(true)
    }
}

impl MemoryDriver {
    fn zrange_sorted(&self, key: &str) -> Vec<(String, f64)> {
        let mut state = self.state.lock();
        purge(&mut state.zsets, key);
        let mut members: Vec<(String, f64)> = state
            .zsets
            .get(key)
            .map(|e| e.value.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        members
    }
}

fn slice_range(members: &[(String, f64)], start: isize, stop: isize) -> Vec<(String, f64)> {
    let len = members.len() as isize;
    if len == 0 {
        return Vec::new();
    }
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start >= len || start > stop {
        return Vec::new();
    }
    members[start as usize..=(stop as usize)].to_vec()
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
