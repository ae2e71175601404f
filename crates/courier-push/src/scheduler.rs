use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use courier_cache::{CacheCluster, CacheError, ClusterScript};
use courier_types::accounts::{AccountDirectory, Device};
use courier_types::metrics::Metrics;
use courier_types::DeviceAddress;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::provider::{PushOutcome, PushSender, WakeNotification};

/// Time-sorted set of pending wake retries, scored by wall time.
const SCHEDULE_KEY: &str = "push_schedule";
/// Attempt counters per scheduled device, for the backoff ladder.
const ATTEMPTS_KEY: &str = "push_schedule_attempts";

/// KEYS: [schedule]
/// ARGV: [not_before_ms, member]
/// Adds the member or lowers its scheduled time; never postpones.
const SCHEDULE_MIN: &str = r#"
local current = redis.call("ZSCORE", KEYS[1], ARGV[2])
if current and tonumber(current) <= tonumber(ARGV[1]) then
    return 0
end
redis.call("ZADD", KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

/// KEYS: [schedule]
/// ARGV: [now_ms, batch]
/// Pops at most `batch` due members in time order.
const TAKE_DUE: &str = r#"
local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[2]))
if #due > 0 then
    redis.call("ZREM", KEYS[1], unpack(due))
end
return due
"#;

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub poll_interval: Duration,
    /// First retry delay; doubles per attempt up to `backoff_cap`.
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
    /// Retries after this many attempts stop and the token is declared stale.
    pub max_attempts: u32,
    /// Entries popped per pump cycle.
    pub batch: usize,
    /// Concurrent provider RPCs.
    pub max_parallel: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            backoff_floor: Duration::from_secs(15),
            backoff_cap: Duration::from_secs(15 * 60),
            max_attempts: 10,
            batch: 100,
            max_parallel: 32,
        }
    }
}

/// The push fallback schedule: devices that were offline when a durable
/// message arrived, waiting for their next platform wake.
pub struct PushScheduler {
    cluster: Arc<CacheCluster>,
    metrics: Arc<Metrics>,
    config: PushConfig,
    schedule_script: ClusterScript,
    take_script: ClusterScript,
}

impl PushScheduler {
    pub fn new(cluster: Arc<CacheCluster>, metrics: Arc<Metrics>, config: PushConfig) -> Self {
        Self {
            cluster,
            metrics,
            config,
            schedule_script: ClusterScript::new(SCHEDULE_MIN),
            take_script: ClusterScript::new(TAKE_DUE),
        }
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    /// Schedules (or advances) a wake for `addr` no earlier than
    /// `not_before_ms`.
    pub async fn schedule(&self, addr: &DeviceAddress, not_before_ms: u64) -> Result<(), CacheError> {
        let added: i64 = self
            .cluster
            .run_script(
                &self.schedule_script,
                SCHEDULE_KEY,
                &[SCHEDULE_KEY.to_string()],
                &[not_before_ms.to_string(), member(addr)],
            )
            .await?;
        if added == 1 {
            self.metrics.pushes_scheduled.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Cancels any pending wake, typically because the device connected or
    /// acknowledged its queue.
    pub async fn cancel(&self, addr: &DeviceAddress) -> Result<(), CacheError> {
        self.cluster.zrem(SCHEDULE_KEY, &member(addr)).await?;
        self.cluster.hdel(ATTEMPTS_KEY, &member(addr)).await?;
        Ok(())
    }

    async fn take_due(&self, now_ms: u64) -> Result<Vec<String>, CacheError> {
        self.cluster
            .run_script(
                &self.take_script,
                SCHEDULE_KEY,
                &[SCHEDULE_KEY.to_string()],
                &[now_ms.to_string(), self.config.batch.to_string()],
            )
            .await
    }

    async fn bump_attempts(&self, addr: &DeviceAddress) -> Result<u32, CacheError> {
        let attempts = self.cluster.hincrby(ATTEMPTS_KEY, &member(addr), 1).await?;
        Ok(attempts.max(0) as u32)
    }
}

fn member(addr: &DeviceAddress) -> String {
    addr.to_string()
}

fn parse_member(member: &str) -> Option<DeviceAddress> {
    let (account, device) = member.split_once("::")?;
    Some(DeviceAddress {
        account: account.parse::<Uuid>().ok()?,
        device_id: device.parse().ok()?,
    })
}

/// Doubling backoff from the floor, capped. `attempts` counts completed
/// sends, so the first retry waits one floor interval.
pub fn backoff(attempts: u32, floor: Duration, cap: Duration) -> Duration {
    let factor = 1u32 << attempts.saturating_sub(1).min(16);
    floor.saturating_mul(factor).min(cap)
}

/// The single pumping loop draining the push schedule into provider RPCs.
pub struct PushWorker {
    scheduler: Arc<PushScheduler>,
    apn: Option<Arc<dyn PushSender>>,
    fcm: Option<Arc<dyn PushSender>>,
    directory: Arc<dyn AccountDirectory>,
    metrics: Arc<Metrics>,
}

impl PushWorker {
    pub fn new(
        scheduler: Arc<PushScheduler>,
        apn: Option<Arc<dyn PushSender>>,
        fcm: Option<Arc<dyn PushSender>>,
        directory: Arc<dyn AccountDirectory>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            scheduler,
            apn,
            fcm,
            directory,
            metrics,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!("push fallback worker started");
        let mut interval = tokio::time::interval(self.scheduler.config.poll_interval);
        let limiter = Arc::new(Semaphore::new(self.scheduler.config.max_parallel));
        loop {
            interval.tick().await;
            if let Err(e) = self.pump(&limiter).await {
                warn!("push pump failed: {}", e);
            }
        }
    }

    async fn pump(&self, limiter: &Arc<Semaphore>) -> Result<(), CacheError> {
        let now = crate::now_ms();
        let due = self.scheduler.take_due(now).await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!("dispatching {} due push entries", due.len());

        let mut join_set = tokio::task::JoinSet::new();
        for entry in due {
            let Some(addr) = parse_member(&entry) else {
                warn!("dropping unparseable push schedule entry {:?}", entry);
                continue;
            };

            let permit = limiter
                .clone()
                .acquire_owned()
                .await
                .expect("push limiter closed");
            let worker = self.clone_refs();
            join_set.spawn(async move {
                let _permit = permit;
                worker.dispatch(addr).await;
            });
        }
        while join_set.join_next().await.is_some() {}
        Ok(())
    }

    fn clone_refs(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
            apn: self.apn.clone(),
            fcm: self.fcm.clone(),
            directory: Arc::clone(&self.directory),
            metrics: Arc::clone(&self.metrics),
        }
    }

    async fn dispatch(&self, addr: DeviceAddress) {
        let Some(account) = self.directory.get(addr.account).await else {
            let _ = self.scheduler.cancel(&addr).await;
            return;
        };
        let Some(device) = account.device(addr.device_id) else {
            let _ = self.scheduler.cancel(&addr).await;
            return;
        };
        if device.fetches_messages {
            // Fetch-style clients are never push-notified.
            let _ = self.scheduler.cancel(&addr).await;
            return;
        }

        let Some((sender, token)) = self.pick_sender(device) else {
            let _ = self.scheduler.cancel(&addr).await;
            return;
        };

        let outcome = sender
            .send(
                &token,
                &WakeNotification {
                    destination: addr,
                },
            )
            .await;

        match outcome {
            PushOutcome::InvalidToken => {
                self.metrics
                    .push_tokens_invalidated
                    .fetch_add(1, Ordering::Relaxed);
                self.directory.clear_push_token(addr.account, addr.device_id).await;
                let _ = self.scheduler.cancel(&addr).await;
            }
            PushOutcome::Delivered | PushOutcome::Transient => {
                if outcome == PushOutcome::Delivered {
                    self.metrics.pushes_sent.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.push_failures.fetch_add(1, Ordering::Relaxed);
                }

                let attempts = match self.scheduler.bump_attempts(&addr).await {
                    Ok(attempts) => attempts,
                    Err(e) => {
                        warn!("failed to track push attempts for {}: {}", addr, e);
                        1
                    }
                };

                if attempts >= self.scheduler.config.max_attempts {
                    // Ladder exhausted: the token is stale until the account
                    // update path replaces it.
                    warn!("push retries exhausted for {}, marking token stale", addr);
                    self.metrics
                        .push_tokens_invalidated
                        .fetch_add(1, Ordering::Relaxed);
                    self.directory.clear_push_token(addr.account, addr.device_id).await;
                    let _ = self.scheduler.cancel(&addr).await;
                    return;
                }

                let config = &self.scheduler.config;
                let delay = backoff(attempts, config.backoff_floor, config.backoff_cap);
                let next = crate::now_ms() + delay.as_millis() as u64;
                if let Err(e) = self.scheduler.schedule(&addr, next).await {
                    warn!("failed to reschedule push for {}: {}", addr, e);
                }
            }
        }
    }

    /// APNs wins when a device somehow carries both tokens.
    fn pick_sender(&self, device: &Device) -> Option<(Arc<dyn PushSender>, String)> {
        if let (Some(sender), Some(token)) = (&self.apn, &device.apn_token) {
            return Some((Arc::clone(sender), token.clone()));
        }
        if let (Some(sender), Some(token)) = (&self.fcm, &device.fcm_token) {
            return Some((Arc::clone(sender), token.clone()));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_roundtrip() {
        let addr = DeviceAddress::new(Uuid::new_v4(), 4);
        assert_eq!(parse_member(&member(&addr)), Some(addr));
        assert_eq!(parse_member("garbage"), None);
        assert_eq!(parse_member("not-a-uuid::2"), None);
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let floor = Duration::from_secs(15);
        let cap = Duration::from_secs(900);
        assert_eq!(backoff(1, floor, cap), Duration::from_secs(15));
        assert_eq!(backoff(2, floor, cap), Duration::from_secs(30));
        assert_eq!(backoff(3, floor, cap), Duration::from_secs(60));
        assert_eq!(backoff(7, floor, cap), Duration::from_secs(900));
        assert_eq!(backoff(30, floor, cap), cap);
    }
}
