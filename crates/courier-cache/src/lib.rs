pub mod breaker;
pub mod pubsub;
pub mod script;

use std::time::Duration;

use rand::Rng;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
pub use crate::pubsub::KeyspaceSubscriber;
pub use crate::script::ClusterScript;

/// Tuning knobs for the cluster client. Defaults match the production
/// configuration; tests shrink the timings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Per-command timeout; applies to every network round trip.
    pub command_timeout: Duration,
    /// Total attempts per command (1 initial + retries) on transient errors.
    pub max_attempts: u32,
    pub retry_floor: Duration,
    pub retry_cap: Duration,
    /// Ring size of the per-shard circuit breaker.
    pub breaker_window: usize,
    /// Failure ratio over a full ring that opens the breaker.
    pub breaker_failure_ratio: f64,
    /// How long an open breaker fails fast before allowing a probe.
    pub breaker_cooldown: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(3),
            max_attempts: 3,
            retry_floor: Duration::from_millis(50),
            retry_cap: Duration::from_millis(500),
            breaker_window: 100,
            breaker_failure_ratio: 0.5,
            breaker_cooldown: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    /// Network fault, command timeout, or server-side overload. Safe to
    /// retry; the breaker counts these.
    #[error("transient cache failure: {0}")]
    Transient(#[source] redis::RedisError),

    #[error("cache command timed out")]
    Timeout,

    /// Wrong type, bad script, malformed reply. Retrying cannot help and
    /// the breaker ignores these.
    #[error("cache error: {0}")]
    Logical(#[source] redis::RedisError),

    #[error("circuit open for cache shard {0}")]
    CircuitOpen(usize),
}

impl CacheError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout | Self::CircuitOpen(_))
    }
}

fn is_transient_error(err: &redis::RedisError) -> bool {
    use redis::ErrorKind;
    err.is_timeout()
        || err.is_connection_dropped()
        || matches!(
            err.kind(),
            ErrorKind::IoError
                | ErrorKind::TryAgain
                | ErrorKind::BusyLoadingError
                | ErrorKind::ClusterDown
                | ErrorKind::MasterDown
        )
}

struct Shard {
    url: String,
    client: redis::Client,
    manager: ConnectionManager,
    breaker: CircuitBreaker,
}

/// Fault-tolerant client for a set of cache shards.
///
/// Keys route to a shard by the FNV-1a hash of their hash tag (the substring
/// inside `{...}`, or the whole key when untagged), so keys sharing a tag are
/// guaranteed to co-locate and can be touched by one atomic script. Every
/// command runs behind the shard's circuit breaker with a bounded retry
/// policy on transient errors.
pub struct CacheCluster {
    shards: Vec<Shard>,
    config: CacheConfig,
}

impl CacheCluster {
    pub async fn connect(urls: &[String], config: CacheConfig) -> Result<Self, CacheError> {
        assert!(!urls.is_empty(), "at least one cache shard url required");

        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(3)
            .set_exponent_base(2)
            .set_max_delay(2_000);

        let mut shards = Vec::with_capacity(urls.len());
        for (index, url) in urls.iter().enumerate() {
            let client = redis::Client::open(url.as_str()).map_err(CacheError::Logical)?;
            let manager = client
                .get_connection_manager_with_config(manager_config.clone())
                .await
                .map_err(CacheError::Transient)?;
            shards.push(Shard {
                url: url.clone(),
                client,
                manager,
                breaker: CircuitBreaker::new(
                    format!("shard-{index}"),
                    config.breaker_window,
                    config.breaker_failure_ratio,
                    config.breaker_cooldown,
                ),
            });
        }

        info!("cache cluster connected ({} shards)", shards.len());
        Ok(Self { shards, config })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index a key routes to. Keys with the same `{tag}` always map to
    /// the same shard.
    pub fn shard_for_key(&self, key: &str) -> usize {
        (fnv1a_64(hash_tag(key).as_bytes()) % self.shards.len() as u64) as usize
    }

    /// One pub/sub-capable client per shard, for keyspace subscriptions.
    pub fn pubsub_clients(&self) -> Vec<redis::Client> {
        self.shards.iter().map(|s| s.client.clone()).collect()
    }

    async fn execute<T: redis::FromRedisValue>(
        &self,
        shard_index: usize,
        cmd: redis::Cmd,
    ) -> Result<T, CacheError> {
        let shard = &self.shards[shard_index];
        let mut attempt: u32 = 0;
        loop {
            if !shard.breaker.try_acquire() {
                return Err(CacheError::CircuitOpen(shard_index));
            }

            let mut conn = shard.manager.clone();
            let outcome: Result<redis::RedisResult<T>, _> =
                tokio::time::timeout(self.config.command_timeout, cmd.query_async(&mut conn)).await;

            let err = match outcome {
                Ok(Ok(value)) => {
                    shard.breaker.record_success();
                    return Ok(value);
                }
                Ok(Err(e)) if is_transient_error(&e) => {
                    shard.breaker.record_failure();
                    CacheError::Transient(e)
                }
                Ok(Err(e)) => {
                    // A logical error is a successful round trip as far as
                    // shard health is concerned.
                    shard.breaker.record_success();
                    return Err(CacheError::Logical(e));
                }
                Err(_) => {
                    shard.breaker.record_failure();
                    CacheError::Timeout
                }
            };

            attempt += 1;
            if attempt >= self.config.max_attempts {
                warn!(
                    "cache command failed after {} attempts on {}: {}",
                    attempt, shard.url, err
                );
                return Err(err);
            }
            let delay = retry_delay(attempt, self.config.retry_floor, self.config.retry_cap);
            debug!("cache retry {} on {} in {:?}", attempt, shard.url, delay);
            tokio::time::sleep(delay).await;
        }
    }

    // -- plain commands, routed by key --

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.execute(self.shard_for_key(key), cmd).await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl_secs);
        self.execute(self.shard_for_key(key), cmd).await
    }

    /// SET NX EX; returns true when the key was set (lock acquired).
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, CacheError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("EX").arg(ttl_secs);
        let reply: Option<String> = self.execute(self.shard_for_key(key), cmd).await?;
        Ok(reply.is_some())
    }

    /// Deletes co-tagged keys in one command. All keys must share a hash tag.
    pub async fn del(&self, keys: &[String]) -> Result<i64, CacheError> {
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        self.execute(self.shard_for_key(&keys[0]), cmd).await
    }

    pub async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(key);
        self.execute(self.shard_for_key(key), cmd).await
    }

    pub async fn zcard(&self, key: &str) -> Result<i64, CacheError> {
        let mut cmd = redis::cmd("ZCARD");
        cmd.arg(key);
        self.execute(self.shard_for_key(key), cmd).await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<i64, CacheError> {
        let mut cmd = redis::cmd("ZREM");
        cmd.arg(key).arg(member);
        self.execute(self.shard_for_key(key), cmd).await
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<i64, CacheError> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(payload);
        self.execute(self.shard_for_key(channel), cmd).await
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.execute(self.shard_for_key(key), cmd).await
    }

    pub async fn hincrby(&self, key: &str, field: &str, by: i64) -> Result<i64, CacheError> {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(key).arg(field).arg(by);
        self.execute(self.shard_for_key(key), cmd).await
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<i64, CacheError> {
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key).arg(field);
        self.execute(self.shard_for_key(key), cmd).await
    }

    /// ZRANGEBYSCORE -inf..=max with a result cap, routed by key.
    pub async fn zrangebyscore_limit(
        &self,
        key: &str,
        max_score: u64,
        limit: usize,
    ) -> Result<Vec<String>, CacheError> {
        self.zrangebyscore_limit_on(self.shard_for_key(key), key, max_score, limit)
            .await
    }

    /// Same, but against an explicit shard. Used for per-shard bookkeeping
    /// keys whose placement follows the queues they index rather than their
    /// own name.
    pub async fn zrangebyscore_limit_on(
        &self,
        shard: usize,
        key: &str,
        max_score: u64,
        limit: usize,
    ) -> Result<Vec<String>, CacheError> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key)
            .arg("-inf")
            .arg(max_score)
            .arg("LIMIT")
            .arg(0)
            .arg(limit);
        self.execute(shard, cmd).await
    }

    /// Runs an atomic script against the shard owning `routing_key`. All
    /// KEYS the script touches must share that key's hash tag (or be the
    /// shard's own bookkeeping keys).
    pub async fn run_script<T: redis::FromRedisValue>(
        &self,
        script: &ClusterScript,
        routing_key: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<T, CacheError> {
        self.run_script_on(script, self.shard_for_key(routing_key), keys, args)
            .await
    }

    pub async fn run_script_on<T: redis::FromRedisValue>(
        &self,
        script: &ClusterScript,
        shard_index: usize,
        keys: &[String],
        args: &[String],
    ) -> Result<T, CacheError> {
        let shard = &self.shards[shard_index];
        let mut attempt: u32 = 0;
        loop {
            if !shard.breaker.try_acquire() {
                return Err(CacheError::CircuitOpen(shard_index));
            }

            let mut conn = shard.manager.clone();
            let outcome: Result<redis::RedisResult<T>, _> = tokio::time::timeout(
                self.config.command_timeout,
                script.invoke(&mut conn, keys, args),
            )
            .await;

            let err = match outcome {
                Ok(Ok(value)) => {
                    shard.breaker.record_success();
                    return Ok(value);
                }
                Ok(Err(e)) if is_transient_error(&e) => {
                    shard.breaker.record_failure();
                    CacheError::Transient(e)
                }
                Ok(Err(e)) => {
                    shard.breaker.record_success();
                    return Err(CacheError::Logical(e));
                }
                Err(_) => {
                    shard.breaker.record_failure();
                    CacheError::Timeout
                }
            };

            attempt += 1;
            if attempt >= self.config.max_attempts {
                warn!(
                    "cache script {} failed after {} attempts on {}: {}",
                    script.digest(),
                    attempt,
                    shard.url,
                    err
                );
                return Err(err);
            }
            tokio::time::sleep(retry_delay(attempt, self.config.retry_floor, self.config.retry_cap)).await;
        }
    }
}

/// Substring inside the first `{...}` pair, or the whole key when untagged.
/// Mirrors the cluster hash-slot tagging convention so co-tagged keys are
/// script-safe.
pub fn hash_tag(key: &str) -> &str {
    if let Some(open) = key.find('{') {
        if let Some(close) = key[open + 1..].find('}') {
            if close > 0 {
                return &key[open + 1..open + 1 + close];
            }
        }
    }
    key
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn retry_delay(attempt: u32, floor: Duration, cap: Duration) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    let base = floor.saturating_mul(factor).min(cap);
    // Half-width jitter keeps simultaneous retries from re-colliding.
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2 + 1);
    base + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tag_extraction() {
        assert_eq!(hash_tag("user_queue::{abc::1}"), "abc::1");
        assert_eq!(hash_tag("user_queue_metadata::{abc::1}"), "abc::1");
        assert_eq!(hash_tag("untagged_key"), "untagged_key");
        assert_eq!(hash_tag("empty_tag::{}"), "empty_tag::{}");
    }

    #[test]
    fn co_tagged_keys_share_a_hash() {
        let a = fnv1a_64(hash_tag("user_queue::{acct::7}").as_bytes());
        let b = fnv1a_64(hash_tag("user_queue_counter::{acct::7}").as_bytes());
        assert_eq!(a, b);

        let c = fnv1a_64(hash_tag("user_queue::{acct::8}").as_bytes());
        assert_ne!(a, c);
    }

    #[test]
    fn retry_delay_is_bounded() {
        let floor = Duration::from_millis(50);
        let cap = Duration::from_millis(500);
        for attempt in 1..10 {
            let d = retry_delay(attempt, floor, cap);
            assert!(d >= floor.min(cap));
            // cap plus maximum jitter
            assert!(d <= cap + Duration::from_millis(251));
        }
    }
}
