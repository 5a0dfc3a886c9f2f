// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Redis-backed KV driver.
//!
//! Regular commands share one multiplexed connection. Blocking pops get a
//! short-lived dedicated connection so they never stall the shared one, and
//! each pattern subscription pumps its own pub/sub connection into a channel
//! from a background task.

use crate::atomic::{
    CounterTransition, LockHandoff, TransitionReply, DEL_IF_EQUALS_LUA, HANDOFF_LUA,
    PEXPIRE_IF_EQUALS_LUA, TRANSITION_LUA,
};
use crate::driver::{KvDriver, KvError, KvMessage, KvOp, KvReply, Subscription};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Buffer depth for pub/sub subscriptions; slow subscribers drop messages
/// (delivery is best-effort by contract).
const SUBSCRIPTION_BUFFER: usize = 256;

/// SCAN/SSCAN page size.
const SCAN_PAGE: usize = 200;

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        KvError::Transport(err.to_string())
    }
}

/// KV driver over a live Redis connection.
#[derive(Clone)]
pub struct RedisDriver {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisDriver {
    /// Open a client and establish the shared multiplexed connection.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

fn score_bound(value: f64) -> String {
    if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if value == f64::INFINITY {
        "+inf".to_string()
    } else {
        value.to_string()
    }
}

fn op_command(op: &KvOp) -> redis::Cmd {
    match op {
        KvOp::Set { key, value, ttl } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
            cmd
        }
        KvOp::SetNx { key, value, ttl } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value).arg("NX");
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
            cmd
        }
        KvOp::Del { key } => {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(key);
            cmd
        }
        KvOp::HSet { key, fields } => {
            let mut cmd = redis::cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            cmd
        }
        KvOp::SAdd { key, member } => {
            let mut cmd = redis::cmd("SADD");
            cmd.arg(key).arg(member);
            cmd
        }
        KvOp::SRem { key, member } => {
            let mut cmd = redis::cmd("SREM");
            cmd.arg(key).arg(member);
            cmd
        }
        KvOp::ZAdd { key, member, score } => {
            let mut cmd = redis::cmd("ZADD");
            cmd.arg(key).arg(*score).arg(member);
            cmd
        }
        KvOp::ZRem { key, member } => {
            let mut cmd = redis::cmd("ZREM");
            cmd.arg(key).arg(member);
            cmd
        }
        KvOp::LPush { key, value } => {
            let mut cmd = redis::cmd("LPUSH");
            cmd.arg(key).arg(value);
            cmd
        }
        KvOp::PExpire { key, ttl } => {
            let mut cmd = redis::cmd("PEXPIRE");
            cmd.arg(key).arg(ttl.as_millis() as u64);
            cmd
        }
    }
}

fn op_reply(op: &KvOp, value: redis::Value) -> KvReply {
    match op {
        KvOp::SetNx { .. } => KvReply::Bool(!matches!(value, redis::Value::Nil)),
        KvOp::Set { .. } | KvOp::HSet { .. } => KvReply::Ok,
        _ => match value {
            redis::Value::Int(n) => KvReply::Int(n),
            _ => KvReply::Ok,
        },
    }
}

#[async_trait]
impl KvDriver for RedisDriver {
    async fn ping(&self, timeout: Duration) -> Result<(), KvError> {
        let mut conn = self.conn();
        let ping = async move {
            redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .map(|_| ())
                .map_err(KvError::from)
        };
        tokio::time::timeout(timeout, ping)
            .await
            .map_err(|_| KvError::PingTimeout(timeout))?
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let n: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let n: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let n: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(n > 0)
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let mut conn = self.conn();
        let ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        if ms < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(ms as u64)))
        }
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<i64>(&mut conn).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn();
        Ok(redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut conn = self.conn();
        Ok(redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?)
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, KvError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in fields {
            cmd.arg(*field);
        }
        Ok(cmd.query_async(&mut conn).await?)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, KvError> {
        let mut conn = self.conn();
        Ok(redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let n: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(n > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let n: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(n > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        Ok(redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await?)
    }

    async fn sscan(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut members = Vec::new();
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SSCAN")
                .arg(key)
                .arg(cursor)
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut conn)
                .await?;
            members.extend(page);
            if next == 0 {
                return Ok(members);
            }
            cursor = next;
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64, nx: bool) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        if nx {
            cmd.arg("NX");
        }
        cmd.arg(score).arg(member);
        let n: i64 = cmd.query_async(&mut conn).await?;
        Ok(n > 0)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let n: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(n > 0)
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        let mut conn = self.conn();
        Ok(redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(score_bound(min))
            .arg(score_bound(max))
            .query_async(&mut conn)
            .await?)
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, KvError> {
        let mut conn = self.conn();
        Ok(redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?)
    }

    async fn zrevrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        Ok(redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64, KvError> {
        let mut conn = self.conn();
        Ok(redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?)
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, KvError> {
        // Dedicated connection: BRPOP would block every other command
        // multiplexed on the shared one.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(reply.map(|(_, value)| value))
    }

    async fn llen(&self, key: &str) -> Result<u64, KvError> {
        let mut conn = self.conn();
        Ok(redis::cmd("LLEN").arg(key).query_async(&mut conn).await?)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut conn)
                .await?;
            keys.extend(page);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, KvError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping undecodable pubsub payload");
                        continue;
                    }
                };
                // Receiver gone: subscription was dropped, stop pumping.
                if tx.send(KvMessage { channel, payload }).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(rx))
    }

    async fn exec(&self, ops: Vec<KvOp>) -> Result<Vec<KvReply>, KvError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        for op in &ops {
            pipe.add_command(op_command(op));
        }
        let values: Vec<redis::Value> = pipe.query_async(&mut conn).await?;
        if values.len() != ops.len() {
            return Err(KvError::UnexpectedReply(format!(
                "pipeline returned {} replies for {} ops",
                values.len(),
                ops.len()
            )));
        }
        Ok(ops
            .iter()
            .zip(values)
            .map(|(op, value)| op_reply(op, value))
            .collect())
    }

    async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let n: i64 = redis::Script::new(DEL_IF_EQUALS_LUA)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(n > 0)
    }

    async fn pexpire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let n: i64 = redis::Script::new(PEXPIRE_IF_EQUALS_LUA)
            .key(key)
            .arg(expected)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(n > 0)
    }

    async fn transition(&self, req: CounterTransition) -> Result<TransitionReply, KvError> {
        let mut conn = self.conn();
        let script = redis::Script::new(TRANSITION_LUA);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(&req.hash_key)
            .key(&req.unlock_key)
            .key(&req.active_key)
            .key(&req.last_key)
            .key(&req.running_zset)
            .arg(req.ended_at_ms)
            .arg(&req.unlock_owner)
            .arg(&req.last_value)
            .arg(&req.member)
            .arg(req.retention.as_millis() as u64)
            .arg(req.deltas.len());
        for (field, delta) in &req.deltas {
            invocation.arg(field).arg(*delta);
        }
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        parse_transition_reply(&reply)
    }

    async fn handoff(&self, req: LockHandoff) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let n: i64 = redis::Script::new(HANDOFF_LUA)
            .key(&req.lock_key)
            .key(&req.old_hash_key)
            .key(&req.running_zset)
            .key(&req.last_key)
            .key(&req.active_key)
            .arg(&req.old_owner)
            .arg(&req.new_owner)
            .arg(req.lock_ttl.as_millis() as u64)
            .arg(req.ended_at_ms)
            .arg(&req.error)
            .arg(req.retention.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(n > 0)
    }
}

fn parse_transition_reply(reply: &[String]) -> Result<TransitionReply, KvError> {
    if reply.len() != 6 {
        return Err(KvError::UnexpectedReply(format!(
            "transition returned {} values",
            reply.len()
        )));
    }
    let int = |s: &String| s.parse::<i64>().unwrap_or(0);
    Ok(TransitionReply {
        status: reply[0].clone(),
        completed: int(&reply[1]),
        failed: int(&reply[2]),
        total: int(&reply[3]),
        drifted: int(&reply[4]),
        ended_at_ms: reply[5].parse::<u64>().unwrap_or(0),
    })
}
