use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use courier_cache::{CacheCluster, ClusterScript};
use courier_types::metrics::Metrics;
use tracing::{debug, info, warn};

use crate::cache::MessagesCache;
use crate::keys;
use crate::manager::MessagesManager;
use crate::now_ms;
use crate::scripts;

#[derive(Debug, Clone)]
pub struct PersisterConfig {
    /// Messages younger than this stay in the cache.
    pub persist_delay: Duration,
    /// Sleep between runs; each run drains at most one shard.
    pub run_interval: Duration,
    /// TTL of the per-shard lease; bounds recovery after a crashed worker.
    pub lease_ttl: Duration,
    pub max_queues_per_run: usize,
    pub page_size: usize,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            persist_delay: Duration::from_secs(10 * 60),
            run_interval: Duration::from_millis(100),
            lease_ttl: Duration::from_secs(30),
            max_queues_per_run: 100,
            page_size: 100,
        }
    }
}

/// Background worker that moves aged queue contents into the durable table,
/// one cache shard per run under a distributed lease.
pub struct MessagePersister {
    cluster: Arc<CacheCluster>,
    cache: Arc<MessagesCache>,
    manager: Arc<MessagesManager>,
    metrics: Arc<Metrics>,
    config: PersisterConfig,
    /// Server instance id; identifies this worker on leases.
    owner: String,
    release_script: ClusterScript,
}

impl MessagePersister {
    pub fn new(
        cluster: Arc<CacheCluster>,
        cache: Arc<MessagesCache>,
        manager: Arc<MessagesManager>,
        metrics: Arc<Metrics>,
        config: PersisterConfig,
        owner: String,
    ) -> Self {
        Self {
            cluster,
            cache,
            manager,
            metrics,
            config,
            owner,
            release_script: ClusterScript::new(scripts::RELEASE_IF_OWNED),
        }
    }

    /// Runs forever. Failures inside a run are logged and retried on the
    /// next tick; the lease TTL cleans up after a crashed run.
    pub async fn run(self) {
        info!(
            "message persister started (delay {:?}, {} shards)",
            self.config.persist_delay,
            self.cluster.shard_count()
        );
        let mut interval = tokio::time::interval(self.config.run_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.run_once().await {
                warn!("persister run failed: {}", e);
            }
        }
    }

    /// Claims the next shard in round-robin order and drains its aged
    /// queues. Returns without work when another worker holds the lease.
    pub async fn run_once(&self) -> Result<()> {
        let cursor = self.cluster.incr(keys::PERSIST_CURSOR_KEY).await?;
        let shard = (cursor.unsigned_abs() % self.cluster.shard_count() as u64) as usize;

        let lease_key = keys::persist_lease_key(shard);
        let acquired = self
            .cluster
            .set_nx_ex(&lease_key, &self.owner, self.config.lease_ttl.as_secs())
            .await?;
        if !acquired {
            debug!("shard {} lease is held elsewhere", shard);
            return Ok(());
        }

        let result = self.drain_shard(shard).await;

        // Release the lease unless it already expired and moved on.
        let released: Result<i64, _> = self
            .cluster
            .run_script(
                &self.release_script,
                &lease_key,
                &[lease_key.clone()],
                &[self.owner.clone()],
            )
            .await;
        if let Err(e) = released {
            warn!("failed to release lease for shard {}: {}", shard, e);
        }

        result
    }

    async fn drain_shard(&self, shard: usize) -> Result<()> {
        let older_than = now_ms().saturating_sub(self.config.persist_delay.as_millis() as u64);
        let queues = self
            .cache
            .queues_to_persist(shard, older_than, self.config.max_queues_per_run)
            .await?;

        if queues.is_empty() {
            return Ok(());
        }
        debug!("persisting {} queues on shard {}", queues.len(), shard);

        for queue_key in queues {
            let Some(addr) = keys::parse_queue_key(&queue_key) else {
                warn!("unparseable queue key in shard {} index: {}", shard, queue_key);
                continue;
            };

            if !self.cache.lock_queue_for_persistence(&addr).await? {
                debug!("queue {} is being persisted elsewhere, skipping", queue_key);
                continue;
            }

            let drained = self.drain_queue(&addr).await;
            self.cache.unlock_queue(&addr).await?;

            match drained {
                Ok(moved) if moved > 0 => {
                    self.metrics.queues_persisted.fetch_add(1, Ordering::Relaxed);
                    debug!("persisted {} messages from {}", moved, queue_key);
                }
                Ok(_) => {}
                // Table write failures are transient: leave the queue in the
                // shard index and retry on a later run.
                Err(e) => warn!("failed to persist {}: {}", queue_key, e),
            }
        }
        Ok(())
    }

    async fn drain_queue(&self, addr: &courier_types::DeviceAddress) -> Result<usize> {
        let mut moved = 0;
        loop {
            let page = self
                .manager
                .persist_queue_page(addr, self.config.page_size)
                .await?;
            moved += page;
            if page < self.config.page_size {
                return Ok(moved);
            }
        }
    }
}
