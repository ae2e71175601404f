use std::sync::Arc;

use courier_cache::{CacheCluster, CacheError, ClusterScript, KeyspaceSubscriber};
use courier_types::events::QueueEvent;
use courier_types::{DeviceAddress, Envelope};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::keys;
use crate::now_ms;
use crate::scripts;

/// How long a queue's persist flag may be held before it expires on its own.
const PERSIST_FLAG_TTL_SECS: u64 = 30;

/// Bounded window for the legacy remove-by-(sender, timestamp) scan.
const SENDER_SCAN_WINDOW: usize = 1_000;

const EPHEMERAL_PREFIX: &str = "ephemeral:";

/// Outcome of a remove-by-(sender, timestamp) call. `truncated` means the
/// queue was longer than the scan window, so a miss is not authoritative.
#[derive(Debug)]
pub struct SenderRemoval {
    pub removed: Option<Envelope>,
    pub truncated: bool,
}

/// Per-device ordered queues in the sharded cache.
///
/// Each queue is a ZSET of serialized envelopes scored by a monotonically
/// increasing queue id, plus a guid-to-id hash for O(1) acknowledgement, a
/// counter, and a persist flag. All mutations run as atomic scripts against
/// the shard owning the queue's hash tag.
pub struct MessagesCache {
    cluster: Arc<CacheCluster>,
    /// Server instance id; owns persist flags taken by this process.
    owner: String,

    insert_script: ClusterScript,
    get_items_script: ClusterScript,
    remove_by_guid_script: ClusterScript,
    remove_by_sender_script: ClusterScript,
    drain_and_trim_script: ClusterScript,
    acquire_flag_script: ClusterScript,
    release_if_owned_script: ClusterScript,
    clear_queue_script: ClusterScript,

    listeners: DashMap<DeviceAddress, mpsc::UnboundedSender<QueueEvent>>,
}

impl MessagesCache {
    pub fn new(cluster: Arc<CacheCluster>, owner: String) -> Self {
        Self {
            cluster,
            owner,
            insert_script: ClusterScript::new(scripts::INSERT),
            get_items_script: ClusterScript::new(scripts::GET_ITEMS),
            remove_by_guid_script: ClusterScript::new(scripts::REMOVE_BY_GUID),
            remove_by_sender_script: ClusterScript::new(scripts::REMOVE_BY_SENDER_TIMESTAMP),
            drain_and_trim_script: ClusterScript::new(scripts::DRAIN_AND_TRIM),
            acquire_flag_script: ClusterScript::new(scripts::ACQUIRE_FLAG),
            release_if_owned_script: ClusterScript::new(scripts::RELEASE_IF_OWNED),
            clear_queue_script: ClusterScript::new(scripts::CLEAR_QUEUE),
            listeners: DashMap::new(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.cluster.shard_count()
    }

    pub fn shard_for(&self, addr: &DeviceAddress) -> usize {
        self.cluster.shard_for_key(&keys::queue_key(addr))
    }

    /// Appends an envelope to its destination queue and returns the assigned
    /// queue id. Also publishes a `new` wake event on the queue channel.
    pub async fn insert(&self, envelope: &Envelope) -> Result<u64, CacheError> {
        let addr = envelope.destination();
        let queue = keys::queue_key(&addr);
        let shard = self.cluster.shard_for_key(&queue);
        let serialized = serde_json::to_string(envelope)
            .expect("envelope serialization is infallible");

        let qid: i64 = self
            .cluster
            .run_script(
                &self.insert_script,
                &queue,
                &[
                    queue.clone(),
                    keys::queue_metadata_key(&addr),
                    keys::queue_counter_key(&addr),
                    keys::shard_index_key(shard),
                ],
                &[
                    serialized,
                    envelope.guid.to_string(),
                    keys::queue_events_channel(&addr),
                    now_ms().to_string(),
                ],
            )
            .await?;
        Ok(qid as u64)
    }

    /// Up to `limit` envelopes with queue id greater than `after_qid`, in
    /// insert order. Corrupt entries are dropped with an error log; they are
    /// never retried.
    pub async fn get_items(
        &self,
        addr: &DeviceAddress,
        limit: usize,
        after_qid: u64,
    ) -> Result<Vec<(Envelope, u64)>, CacheError> {
        let queue = keys::queue_key(addr);
        let raw: Vec<(String, u64)> = self
            .cluster
            .run_script(
                &self.get_items_script,
                &queue,
                &[queue.clone()],
                &[limit.to_string(), after_qid.to_string()],
            )
            .await?;

        let mut items = Vec::with_capacity(raw.len());
        for (serialized, qid) in raw {
            match serde_json::from_str::<Envelope>(&serialized) {
                Ok(envelope) => items.push((envelope, qid)),
                Err(e) => error!("dropping corrupt envelope in {}: {}", queue, e),
            }
        }
        Ok(items)
    }

    pub async fn has_messages(&self, addr: &DeviceAddress) -> Result<bool, CacheError> {
        Ok(self.cluster.zcard(&keys::queue_key(addr)).await? > 0)
    }

    /// Removes one envelope by GUID, returning it when present. A second
    /// removal of the same GUID is a no-op.
    pub async fn remove_by_guid(
        &self,
        addr: &DeviceAddress,
        guid: Uuid,
    ) -> Result<Option<Envelope>, CacheError> {
        let queue = keys::queue_key(addr);
        let shard = self.cluster.shard_for_key(&queue);
        let removed: Option<String> = self
            .cluster
            .run_script(
                &self.remove_by_guid_script,
                &queue,
                &[
                    queue.clone(),
                    keys::queue_metadata_key(addr),
                    keys::shard_index_key(shard),
                ],
                &[guid.to_string()],
            )
            .await?;

        Ok(removed.and_then(|s| parse_envelope(&queue, &s)))
    }

    /// Legacy acknowledgement path: bounded scan for (sender, timestamp).
    pub async fn remove_by_sender_timestamp(
        &self,
        addr: &DeviceAddress,
        sender: Uuid,
        client_timestamp: u64,
    ) -> Result<SenderRemoval, CacheError> {
        let queue = keys::queue_key(addr);
        let shard = self.cluster.shard_for_key(&queue);
        let (found, serialized, truncated): (i64, String, i64) = self
            .cluster
            .run_script(
                &self.remove_by_sender_script,
                &queue,
                &[
                    queue.clone(),
                    keys::queue_metadata_key(addr),
                    keys::shard_index_key(shard),
                ],
                &[
                    sender.to_string(),
                    client_timestamp.to_string(),
                    SENDER_SCAN_WINDOW.to_string(),
                ],
            )
            .await?;

        if truncated == 1 {
            warn!(
                "sender-timestamp scan truncated at {} entries for {}",
                SENDER_SCAN_WINDOW, queue
            );
        }

        let removed = if found == 1 {
            parse_envelope(&queue, &serialized)
        } else {
            None
        };
        Ok(SenderRemoval {
            removed,
            truncated: truncated == 1,
        })
    }

    /// Queue keys on `shard` whose oldest unpersisted envelope predates
    /// `older_than_ms`, capped at `max`.
    pub async fn queues_to_persist(
        &self,
        shard: usize,
        older_than_ms: u64,
        max: usize,
    ) -> Result<Vec<String>, CacheError> {
        self.cluster
            .zrangebyscore_limit_on(shard, &keys::shard_index_key(shard), older_than_ms, max)
            .await
    }

    /// Takes the queue's persist flag. `false` means another worker is
    /// already draining this queue.
    pub async fn lock_queue_for_persistence(&self, addr: &DeviceAddress) -> Result<bool, CacheError> {
        let flag = keys::persist_in_progress_key(addr);
        let locked: i64 = self
            .cluster
            .run_script(
                &self.acquire_flag_script,
                &flag,
                &[flag.clone()],
                &[self.owner.clone(), PERSIST_FLAG_TTL_SECS.to_string()],
            )
            .await?;
        Ok(locked == 1)
    }

    pub async fn unlock_queue(&self, addr: &DeviceAddress) -> Result<(), CacheError> {
        let flag = keys::persist_in_progress_key(addr);
        let _: i64 = self
            .cluster
            .run_script(
                &self.release_if_owned_script,
                &flag,
                &[flag.clone()],
                &[self.owner.clone()],
            )
            .await?;
        Ok(())
    }

    /// Atomically removes every envelope with queue id <= `upto_qid` along
    /// with their guid index entries, and announces the persist on the queue
    /// channel. Returns the number of entries trimmed.
    pub async fn drain_and_trim(&self, addr: &DeviceAddress, upto_qid: u64) -> Result<usize, CacheError> {
        let queue = keys::queue_key(addr);
        let shard = self.cluster.shard_for_key(&queue);
        let drained: Vec<String> = self
            .cluster
            .run_script(
                &self.drain_and_trim_script,
                &queue,
                &[
                    queue.clone(),
                    keys::queue_metadata_key(addr),
                    keys::shard_index_key(shard),
                ],
                &[
                    upto_qid.to_string(),
                    now_ms().to_string(),
                    keys::queue_events_channel(addr),
                ],
            )
            .await?;
        Ok(drained.len())
    }

    /// Drops the queue entirely (all four keys plus its index entry).
    pub async fn clear_queue(&self, addr: &DeviceAddress) -> Result<(), CacheError> {
        let queue = keys::queue_key(addr);
        let shard = self.cluster.shard_for_key(&queue);
        let _: i64 = self
            .cluster
            .run_script(
                &self.clear_queue_script,
                &queue,
                &[
                    queue.clone(),
                    keys::queue_metadata_key(addr),
                    keys::queue_counter_key(addr),
                    keys::persist_in_progress_key(addr),
                    keys::shard_index_key(shard),
                ],
                &[],
            )
            .await?;
        Ok(())
    }

    /// Publishes an online-only envelope on the queue's wake channel without
    /// storing it. Whoever holds the socket delivers it; nobody else ever
    /// sees it.
    pub async fn publish_ephemeral(
        &self,
        addr: &DeviceAddress,
        envelope: &Envelope,
    ) -> Result<(), CacheError> {
        let payload = format!(
            "{EPHEMERAL_PREFIX}{}",
            serde_json::to_string(envelope).expect("envelope serialization is infallible")
        );
        self.cluster
            .publish(&keys::queue_events_channel(addr), &payload)
            .await?;
        Ok(())
    }

    // -- availability listeners --

    /// Registers the process-local listener for one queue, replacing any
    /// prior registration (a new session displaces the old one). Events
    /// published on the queue channel from any server fan in here.
    pub fn add_message_availability_listener(
        &self,
        addr: DeviceAddress,
    ) -> mpsc::UnboundedReceiver<QueueEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(addr, tx);
        rx
    }

    pub fn remove_message_availability_listener(&self, addr: &DeviceAddress) {
        self.listeners.remove(addr);
    }

    /// Subscribes the queue event pattern on every shard and routes events
    /// into registered listeners. Call once at startup.
    pub fn start_event_dispatch(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let subscriber = KeyspaceSubscriber::new(self.cluster.pubsub_clients());
        let cache = Arc::clone(self);
        subscriber.spawn(
            vec![keys::QUEUE_EVENTS_PATTERN.to_string()],
            Arc::new(move |channel, payload| cache.dispatch_event(channel, payload)),
        )
    }

    fn dispatch_event(&self, channel: &str, payload: &str) {
        let Some(addr) = keys::parse_queue_events_channel(channel) else {
            debug!("ignoring event on unrecognized channel {}", channel);
            return;
        };

        let event = if payload == "new" {
            QueueEvent::NewMessages
        } else if payload == "persisted" {
            QueueEvent::MessagesPersisted
        } else if let Some(serialized) = payload.strip_prefix(EPHEMERAL_PREFIX) {
            match serde_json::from_str::<Envelope>(serialized) {
                Ok(envelope) => QueueEvent::NewEphemeral(Box::new(envelope)),
                Err(e) => {
                    error!("dropping corrupt ephemeral envelope on {}: {}", channel, e);
                    return;
                }
            }
        } else {
            debug!("ignoring unknown queue event {:?} on {}", payload, channel);
            return;
        };

        if let Some(listener) = self.listeners.get(&addr) {
            if listener.send(event).is_err() {
                drop(listener);
                self.listeners.remove(&addr);
            }
        }
    }
}

fn parse_envelope(queue: &str, serialized: &str) -> Option<Envelope> {
    match serde_json::from_str(serialized) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            error!("dropping corrupt envelope in {}: {}", queue, e);
            None
        }
    }
}
