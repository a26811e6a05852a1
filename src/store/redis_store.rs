//! Redis-backed counter store shared by every service instance.
//!
//! Windows and DDoS logs are sorted sets scored by timestamp, burst counters
//! and bans are plain keys with a TTL. All round trips are bounded by the
//! configured timeout.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use uuid::Uuid;

use super::{CounterStore, StoreError, WindowKey, WindowOutcome, WindowSnapshot, WindowUsage};
use crate::core::classifier::PolicyTable;
use crate::core::window::{evaluate, window_start, WindowDecision};
use crate::models::{BanRecord, PolicyCategory, RedisConfig};
use crate::utils::{datetime_from_ts, format_rate_limit_key};

/// Trim, count, evaluate and record in one server-side step.
///
/// KEYS: window, burst counter. ARGV: now, window, limit, burst, member.
/// Returns `{admitted, current, burst_used, oldest_score}`.
const CHECK_AND_RECORD_SCRIPT: &str = r#"
local key = KEYS[1]
local burst_key = KEYS[2]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local burst = tonumber(ARGV[4])
local member = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local current = redis.call('ZCARD', key)
local burst_used = tonumber(redis.call('GET', burst_key) or '0')

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = oldest[2] or ''

if current >= limit and burst_used >= burst then
    return {0, current, burst_used, oldest_score}
end

redis.call('ZADD', key, now, member)
redis.call('EXPIRE', key, window)
if current >= limit then
    burst_used = redis.call('INCR', burst_key)
    redis.call('EXPIRE', burst_key, window)
end
if oldest_score == '' then
    oldest_score = ARGV[1]
end

return {1, current, burst_used, oldest_score}
"#;

/// Counter store on a Redis server
pub struct RedisStore {
    client: Client,
    connection: tokio::sync::Mutex<Option<ConnectionManager>>,
    last_connect_failure: parking_lot::Mutex<Option<Instant>>,
    timeout: Duration,
    scan_timeout: Duration,
    reconnect_backoff: Duration,
    prefix: String,
    atomic_window: bool,
    window_script: Script,
}

impl RedisStore {
    /// Create a store; no connection is made until the first call
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            connection: tokio::sync::Mutex::new(None),
            last_connect_failure: parking_lot::Mutex::new(None),
            timeout: Duration::from_millis(config.timeout_ms),
            scan_timeout: Duration::from_millis(config.scan_timeout_ms),
            reconnect_backoff: Duration::from_millis(config.reconnect_backoff_ms),
            prefix: config.key_prefix.clone(),
            atomic_window: config.atomic_window,
            window_script: Script::new(CHECK_AND_RECORD_SCRIPT),
        })
    }

    fn key(&self, kind: &str, rest: &str) -> String {
        format!("{}{}", self.prefix, format_rate_limit_key(kind, rest))
    }

    fn window_key(&self, key: &WindowKey) -> String {
        self.key("rl", &key.to_string())
    }

    fn burst_key(&self, key: &WindowKey) -> String {
        self.key("rl_burst", &key.to_string())
    }

    fn hits_key(&self, identity: &str) -> String {
        self.key("ddos_track", identity)
    }

    fn ban_key(&self, identity: &str) -> String {
        self.key("banned", identity)
    }

    fn parse_window_key(&self, raw: &str) -> Option<WindowKey> {
        let rest = raw.strip_prefix(&self.prefix)?.strip_prefix("rl:")?;
        let (category, identity) = rest.split_once(':')?;
        Some(WindowKey::new(category, identity))
    }

    fn member(now: f64) -> String {
        format!("{:.6}-{}", now, Uuid::new_v4())
    }

    /// Shared connection, established lazily and retried after a backoff
    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        if let Some(failed_at) = *self.last_connect_failure.lock() {
            if failed_at.elapsed() < self.reconnect_backoff {
                return Err(StoreError::Unavailable(
                    "waiting before reconnecting to Redis".to_string(),
                ));
            }
        }

        let attempt = tokio::time::timeout(self.timeout, ConnectionManager::new(self.client.clone()));
        match attempt.await {
            Ok(Ok(conn)) => {
                info!("Connected to Redis counter store");
                *self.last_connect_failure.lock() = None;
                *guard = Some(conn.clone());
                Ok(conn)
            }
            Ok(Err(e)) => {
                debug!("Redis connect failed: {}", e);
                *self.last_connect_failure.lock() = Some(Instant::now());
                Err(StoreError::RedisError(e))
            }
            Err(_) => {
                *self.last_connect_failure.lock() = Some(Instant::now());
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }

    async fn bounded<T, F>(&self, limit: Duration, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| StoreError::Timeout(limit))?
    }

    async fn scan_keys(&self, pattern: String) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(self.scan_timeout, async move {
            let mut keys = Vec::new();
            let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            Ok(keys)
        })
        .await
    }

    async fn check_and_record_scripted(
        &self,
        key: &WindowKey,
        policy: &PolicyCategory,
        now: f64,
    ) -> Result<WindowOutcome, StoreError> {
        let window_key = self.window_key(key);
        let burst_key = self.burst_key(key);
        let member = Self::member(now);
        let mut conn = self.connection().await?;

        self.bounded(self.timeout, async {
            let (admitted, current, burst_used, oldest): (i64, u64, u64, String) = self
                .window_script
                .key(&window_key)
                .key(&burst_key)
                .arg(now)
                .arg(policy.window_seconds)
                .arg(policy.max_requests)
                .arg(policy.burst_allowance)
                .arg(&member)
                .invoke_async(&mut conn)
                .await?;

            Ok(WindowOutcome {
                admitted: admitted == 1,
                current,
                burst_used,
                oldest: oldest.parse().ok(),
            })
        })
        .await
    }

    /// Two pipelined round trips; concurrent callers may overshoot the limit
    async fn check_and_record_pipelined(
        &self,
        key: &WindowKey,
        policy: &PolicyCategory,
        now: f64,
    ) -> Result<WindowOutcome, StoreError> {
        let window_key = self.window_key(key);
        let burst_key = self.burst_key(key);
        let member = Self::member(now);
        let window = policy.window_seconds as usize;
        let mut conn = self.connection().await?;

        self.bounded(self.timeout, async {
            let (current, burst_used, oldest): (u64, Option<u64>, Vec<(String, f64)>) =
                redis::pipe()
                    .atomic()
                    .zrembyscore(&window_key, "-inf", window_start(now, policy.window_seconds))
                    .ignore()
                    .zcard(&window_key)
                    .get(&burst_key)
                    .zrange_withscores(&window_key, 0, 0)
                    .query_async(&mut conn)
                    .await?;
            let burst_used = burst_used.unwrap_or(0);
            let oldest = oldest.first().map(|(_, score)| *score);

            let uses_burst = match evaluate(current, burst_used, policy) {
                WindowDecision::Deny => {
                    return Ok(WindowOutcome {
                        admitted: false,
                        current,
                        burst_used,
                        oldest,
                    })
                }
                WindowDecision::Admit { uses_burst } => uses_burst,
            };

            let mut pipe = redis::pipe();
            pipe.atomic()
                .zadd(&window_key, &member, now)
                .ignore()
                .expire(&window_key, window)
                .ignore();

            let burst_used = if uses_burst {
                pipe.incr(&burst_key, 1).expire(&burst_key, window).ignore();
                let (used,): (u64,) = pipe.query_async(&mut conn).await?;
                used
            } else {
                pipe.query_async::<_, ()>(&mut conn).await?;
                burst_used
            };

            Ok(WindowOutcome {
                admitted: true,
                current,
                burst_used,
                oldest: oldest.or(Some(now)),
            })
        })
        .await
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(self.timeout, async {
            redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn check_and_record(
        &self,
        key: &WindowKey,
        policy: &PolicyCategory,
        now: f64,
    ) -> Result<WindowOutcome, StoreError> {
        if self.atomic_window {
            self.check_and_record_scripted(key, policy, now).await
        } else {
            self.check_and_record_pipelined(key, policy, now).await
        }
    }

    async fn window_usage(
        &self,
        key: &WindowKey,
        window_seconds: u64,
        now: f64,
    ) -> Result<WindowUsage, StoreError> {
        let window_key = self.window_key(key);
        let burst_key = self.burst_key(key);
        let mut conn = self.connection().await?;

        self.bounded(self.timeout, async {
            let (current, burst_used, oldest): (u64, Option<u64>, Vec<(String, f64)>) =
                redis::pipe()
                    .atomic()
                    .zrembyscore(&window_key, "-inf", window_start(now, window_seconds))
                    .ignore()
                    .zcard(&window_key)
                    .get(&burst_key)
                    .zrange_withscores(&window_key, 0, 0)
                    .query_async(&mut conn)
                    .await?;

            Ok(WindowUsage {
                current,
                burst_used: burst_used.unwrap_or(0),
                oldest: oldest.first().map(|(_, score)| *score),
            })
        })
        .await
    }

    async fn reset_window(&self, key: &WindowKey) -> Result<bool, StoreError> {
        let keys = vec![self.window_key(key), self.burst_key(key)];
        let mut conn = self.connection().await?;
        self.bounded(self.timeout, async {
            let removed: u64 = conn.del(keys).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn record_hit(
        &self,
        identity: &str,
        window_seconds: u64,
        now: f64,
    ) -> Result<u64, StoreError> {
        let hits_key = self.hits_key(identity);
        let member = Self::member(now);
        let mut conn = self.connection().await?;

        self.bounded(self.timeout, async {
            let (count,): (u64,) = redis::pipe()
                .atomic()
                .zadd(&hits_key, &member, now)
                .ignore()
                .zrembyscore(&hits_key, "-inf", window_start(now, window_seconds))
                .ignore()
                .zcard(&hits_key)
                .expire(&hits_key, window_seconds as usize)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(count)
        })
        .await
    }

    async fn hit_count(
        &self,
        identity: &str,
        window_seconds: u64,
        now: f64,
    ) -> Result<u64, StoreError> {
        let hits_key = self.hits_key(identity);
        let lower = format!("({}", window_start(now, window_seconds));
        let mut conn = self.connection().await?;

        self.bounded(self.timeout, async {
            let count: u64 = conn.zcount(&hits_key, lower, "+inf").await?;
            Ok(count)
        })
        .await
    }

    async fn put_ban(&self, record: &BanRecord) -> Result<(), StoreError> {
        let ban_key = self.ban_key(&record.identity);
        let payload = serde_json::to_string(record)?;
        let ttl = record.duration_seconds.max(1) as usize;
        let mut conn = self.connection().await?;

        self.bounded(self.timeout, async {
            conn.set_ex::<_, _, ()>(&ban_key, payload, ttl).await?;
            Ok(())
        })
        .await
    }

    async fn get_ban(&self, identity: &str, now: f64) -> Result<Option<BanRecord>, StoreError> {
        let ban_key = self.ban_key(identity);
        let mut conn = self.connection().await?;

        let (payload, ttl): (Option<String>, i64) = self
            .bounded(self.timeout, async {
                let reply = redis::pipe()
                    .get(&ban_key)
                    .ttl(&ban_key)
                    .query_async(&mut conn)
                    .await?;
                Ok(reply)
            })
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        // Entries written by other tools may not carry a record
        let record = serde_json::from_str(&payload).unwrap_or_else(|_| BanRecord {
            identity: identity.to_string(),
            reason: "unknown".to_string(),
            banned_at: datetime_from_ts(now),
            duration_seconds: ttl.max(1) as u64,
        });
        Ok(Some(record))
    }

    async fn delete_ban(&self, identity: &str) -> Result<bool, StoreError> {
        let ban_key = self.ban_key(identity);
        let mut conn = self.connection().await?;
        self.bounded(self.timeout, async {
            let removed: u64 = conn.del(&ban_key).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn active_windows(
        &self,
        policies: &PolicyTable,
        now: f64,
    ) -> Result<Vec<WindowSnapshot>, StoreError> {
        let keys: Vec<(String, WindowKey)> = self
            .scan_keys(format!("{}rl:*", self.prefix))
            .await?
            .into_iter()
            .filter_map(|raw| self.parse_window_key(&raw).map(|key| (raw, key)))
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let counts: Vec<u64> = self
            .bounded(self.scan_timeout, async {
                let mut pipe = redis::pipe();
                for (raw, key) in &keys {
                    let window_seconds = policies.resolve(&key.category).window_seconds;
                    let start = format!("({}", window_start(now, window_seconds));
                    pipe.zcount(raw, start, "+inf");
                }
                let counts = pipe.query_async(&mut conn).await?;
                Ok(counts)
            })
            .await?;

        Ok(keys
            .into_iter()
            .zip(counts)
            .filter(|(_, count)| *count > 0)
            .map(|((_, key), count)| WindowSnapshot { key, count })
            .collect())
    }

    async fn ban_count(&self, _now: f64) -> Result<u64, StoreError> {
        let keys = self.scan_keys(format!("{}banned:*", self.prefix)).await?;
        Ok(keys.len() as u64)
    }

    async fn purge_expired(&self, max_window_seconds: u64, now: f64) -> Result<u64, StoreError> {
        let mut keys = self.scan_keys(format!("{}rl:*", self.prefix)).await?;
        keys.extend(self.scan_keys(format!("{}ddos_track:*", self.prefix)).await?);
        if keys.is_empty() {
            return Ok(0);
        }

        let cutoff = window_start(now, max_window_seconds);
        let mut conn = self.connection().await?;
        let removed: Vec<u64> = self
            .bounded(self.scan_timeout, async {
                let mut pipe = redis::pipe();
                for key in &keys {
                    pipe.zrembyscore(key, "-inf", cutoff);
                }
                let removed = pipe.query_async(&mut conn).await?;
                Ok(removed)
            })
            .await?;

        // Bans and burst counters expire through their TTL
        Ok(removed.into_iter().sum())
    }
}
