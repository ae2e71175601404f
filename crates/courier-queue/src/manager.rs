use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use courier_db::models::MessageRow;
use courier_db::Database;
use courier_types::events::QueueEvent;
use courier_types::metrics::Metrics;
use courier_types::{DeviceAddress, Envelope, EnvelopeKind};
use tokio::sync::mpsc;
use tracing::error;
use uuid::Uuid;

use crate::cache::MessagesCache;
use crate::now_ms;

/// Upper bound on a single merged read. Matches the HTTP page size.
pub const READ_LIMIT: usize = 10_000;

/// Unified per-device queue over the cache and the durable table.
///
/// Inserts always land in the cache; reads merge the table (older, already
/// persisted) with the cache (newer), deduplicated by GUID with the cache
/// copy winning; deletes try the cache first and fall through to the table.
pub struct MessagesManager {
    cache: Arc<MessagesCache>,
    db: Arc<Database>,
    metrics: Arc<Metrics>,
    retention_ms: u64,
}

impl MessagesManager {
    pub fn new(
        cache: Arc<MessagesCache>,
        db: Arc<Database>,
        metrics: Arc<Metrics>,
        retention_ms: u64,
    ) -> Self {
        Self {
            cache,
            db,
            metrics,
            retention_ms,
        }
    }

    pub fn cache(&self) -> &Arc<MessagesCache> {
        &self.cache
    }

    /// Stores an envelope in its destination queue. Marks the queue's
    /// activation time when it was empty, for push-latency accounting.
    pub async fn insert(&self, envelope: &Envelope) -> Result<u64> {
        let addr = envelope.destination();
        if !self.cache.has_messages(&addr).await? {
            self.metrics.record_queue_activated(addr, now_ms());
        }

        let qid = self.cache.insert(envelope).await?;
        self.metrics.messages_inserted.fetch_add(1, Ordering::Relaxed);
        Ok(qid)
    }

    /// Merged, ascending-by-server-timestamp page for one device, bounded at
    /// `READ_LIMIT`. The boolean reports whether more messages remain.
    pub async fn get_messages_for_device(
        &self,
        addr: &DeviceAddress,
        cached_only: bool,
    ) -> Result<(Vec<Envelope>, bool)> {
        let cache_items = self.cache.get_items(addr, READ_LIMIT + 1, 0).await?;
        let cached: Vec<Envelope> = cache_items.into_iter().map(|(env, _)| env).collect();

        let stored = if cached_only {
            Vec::new()
        } else {
            let db = Arc::clone(&self.db);
            let account = addr.account.to_string();
            let device_id = addr.device_id;
            let rows = tokio::task::spawn_blocking(move || {
                db.load_for_device(&account, device_id, READ_LIMIT + 1)
            })
            .await??;
            self.envelopes_from_rows(rows)
        };

        Ok(merge_pages(stored, cached, READ_LIMIT))
    }

    /// Acknowledgement by GUID: cache first, then the durable table.
    pub async fn delete_by_guid(&self, addr: &DeviceAddress, guid: Uuid) -> Result<Option<Envelope>> {
        if let Some(envelope) = self.cache.remove_by_guid(addr, guid).await? {
            return Ok(Some(envelope));
        }

        let db = Arc::clone(&self.db);
        let row = tokio::task::spawn_blocking(move || db.delete_by_guid(&guid.to_string())).await??;
        Ok(row.and_then(|r| self.envelope_from_row(r)))
    }

    /// Acknowledgement by (sender, client timestamp), the legacy path.
    pub async fn delete_by_sender_timestamp(
        &self,
        addr: &DeviceAddress,
        sender: Uuid,
        client_timestamp: u64,
    ) -> Result<Option<Envelope>> {
        let outcome = self
            .cache
            .remove_by_sender_timestamp(addr, sender, client_timestamp)
            .await?;
        if outcome.truncated {
            self.metrics
                .sender_scans_truncated
                .fetch_add(1, Ordering::Relaxed);
        }
        if let Some(envelope) = outcome.removed {
            return Ok(Some(envelope));
        }

        let db = Arc::clone(&self.db);
        let account = addr.account.to_string();
        let device_id = addr.device_id;
        let row = tokio::task::spawn_blocking(move || {
            db.delete_by_sender_timestamp(&account, device_id, &sender.to_string(), client_timestamp)
        })
        .await??;
        Ok(row.and_then(|r| self.envelope_from_row(r)))
    }

    pub async fn clear_device(&self, addr: &DeviceAddress) -> Result<()> {
        self.cache.clear_queue(addr).await?;

        let db = Arc::clone(&self.db);
        let account = addr.account.to_string();
        let device_id = addr.device_id;
        tokio::task::spawn_blocking(move || db.delete_device(&account, device_id)).await??;
        Ok(())
    }

    pub async fn clear_account(&self, account: Uuid, device_ids: &[u8]) -> Result<()> {
        for device_id in device_ids {
            self.cache
                .clear_queue(&DeviceAddress::new(account, *device_id))
                .await?;
        }

        let db = Arc::clone(&self.db);
        let account = account.to_string();
        tokio::task::spawn_blocking(move || db.delete_account(&account)).await??;
        Ok(())
    }

    /// Moves one page of a queue's oldest envelopes into the durable table,
    /// then trims the cache up to the last written queue id. Returns the
    /// page size actually moved. The table write precedes the trim, and the
    /// write is idempotent per GUID, so a crash between the two re-persists
    /// harmlessly.
    pub async fn persist_queue_page(&self, addr: &DeviceAddress, page: usize) -> Result<usize> {
        let items = self.cache.get_items(addr, page, 0).await?;
        let Some((_, last_qid)) = items.last() else {
            return Ok(0);
        };
        let upto_qid = *last_qid;

        let rows: Vec<MessageRow> = items
            .iter()
            .map(|(env, _)| self.row_from_envelope(env))
            .collect();
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || db.store_messages(&rows)).await??;

        self.cache.drain_and_trim(addr, upto_qid).await?;
        self.metrics
            .messages_persisted
            .fetch_add(items.len() as u64, Ordering::Relaxed);
        Ok(items.len())
    }

    /// Registers the process-local availability listener for one queue.
    /// At most one exists per (account, device) per process; a new
    /// registration replaces the old one.
    pub fn add_message_availability_listener(
        &self,
        addr: DeviceAddress,
    ) -> mpsc::UnboundedReceiver<QueueEvent> {
        self.cache.add_message_availability_listener(addr)
    }

    pub fn remove_message_availability_listener(&self, addr: &DeviceAddress) {
        self.cache.remove_message_availability_listener(addr);
    }

    fn row_from_envelope(&self, envelope: &Envelope) -> MessageRow {
        MessageRow {
            account_uuid: envelope.destination_uuid.to_string(),
            device_id: envelope.destination_device,
            server_ts: envelope.server_timestamp,
            guid: envelope.guid.to_string(),
            kind: envelope.kind.code(),
            client_ts: envelope.client_timestamp,
            source_uuid: envelope.source_uuid.map(|u| u.to_string()),
            source_device: envelope.source_device,
            content: envelope.content.clone(),
            expires_at: envelope.server_timestamp + self.retention_ms,
        }
    }

    fn envelopes_from_rows(&self, rows: Vec<MessageRow>) -> Vec<Envelope> {
        rows.into_iter()
            .filter_map(|row| self.envelope_from_row(row))
            .collect()
    }

    fn envelope_from_row(&self, row: MessageRow) -> Option<Envelope> {
        match try_envelope_from_row(row) {
            Ok(envelope) => Some(envelope),
            Err(guid) => {
                // Corrupt rows are dropped, never retried.
                self.metrics.corrupt_envelopes.fetch_add(1, Ordering::Relaxed);
                error!("dropping corrupt stored message {}", guid);
                None
            }
        }
    }
}

fn try_envelope_from_row(row: MessageRow) -> std::result::Result<Envelope, String> {
    let guid = row.guid.clone();
    let kind = EnvelopeKind::from_code(row.kind).ok_or_else(|| guid.clone())?;
    Ok(Envelope {
        guid: row.guid.parse().map_err(|_| guid.clone())?,
        kind,
        client_timestamp: row.client_ts,
        server_timestamp: row.server_ts,
        source_uuid: match row.source_uuid {
            Some(s) => Some(s.parse().map_err(|_| guid.clone())?),
            None => None,
        },
        source_device: row.source_device,
        destination_uuid: row.account_uuid.parse().map_err(|_| guid)?,
        destination_device: row.device_id,
        content: row.content,
    })
}

/// Concatenates the already-persisted page with the cache page: stored rows
/// first (they are older), then cache entries, deduplicated by GUID with the
/// cache copy winning. The returned flag reports truncation at `limit`.
fn merge_pages(stored: Vec<Envelope>, cached: Vec<Envelope>, limit: usize) -> (Vec<Envelope>, bool) {
    let mut seen: HashSet<Uuid> = HashSet::with_capacity(cached.len());
    let mut cache_page = Vec::with_capacity(cached.len());
    for envelope in cached {
        // A duplicate-GUID insert leaves two copies in the ordered queue;
        // readers surface the first only.
        if seen.insert(envelope.guid) {
            cache_page.push(envelope);
        }
    }

    let mut merged: Vec<Envelope> = stored
        .into_iter()
        .filter(|envelope| !seen.contains(&envelope.guid))
        .collect();
    merged.extend(cache_page);

    let more = merged.len() > limit;
    merged.truncate(limit);
    (merged, more)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(guid: Uuid, server_timestamp: u64) -> Envelope {
        Envelope {
            guid,
            kind: EnvelopeKind::Ciphertext,
            client_timestamp: server_timestamp,
            server_timestamp,
            source_uuid: None,
            source_device: None,
            destination_uuid: Uuid::new_v4(),
            destination_device: 1,
            content: Some(vec![1]),
        }
    }

    #[test]
    fn merge_prefers_cache_copy_for_shared_guid() {
        let shared = Uuid::new_v4();
        let mut stored_copy = envelope(shared, 100);
        stored_copy.client_timestamp = 1;
        let mut cache_copy = envelope(shared, 100);
        cache_copy.client_timestamp = 2;

        let (merged, more) = merge_pages(vec![stored_copy], vec![cache_copy], 10);
        assert!(!more);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].client_timestamp, 2);
    }

    #[test]
    fn merge_keeps_stored_then_cached_order() {
        let stored = vec![envelope(Uuid::new_v4(), 100), envelope(Uuid::new_v4(), 200)];
        let cached = vec![envelope(Uuid::new_v4(), 300)];

        let (merged, _) = merge_pages(stored.clone(), cached.clone(), 10);
        let timestamps: Vec<u64> = merged.iter().map(|e| e.server_timestamp).collect();
        assert_eq!(timestamps, vec![100, 200, 300]);
    }

    #[test]
    fn merge_dedups_duplicate_guid_within_cache_page() {
        let dup = Uuid::new_v4();
        let cached = vec![envelope(dup, 100), envelope(dup, 200), envelope(Uuid::new_v4(), 300)];

        let (merged, _) = merge_pages(Vec::new(), cached, 10);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].server_timestamp, 100);
    }

    #[test]
    fn merge_reports_truncation() {
        let cached: Vec<Envelope> = (0..5).map(|i| envelope(Uuid::new_v4(), i)).collect();
        let (merged, more) = merge_pages(Vec::new(), cached, 3);
        assert!(more);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn row_envelope_roundtrip() {
        let env = Envelope {
            guid: Uuid::new_v4(),
            kind: EnvelopeKind::PrekeyBundle,
            client_timestamp: 11,
            server_timestamp: 22,
            source_uuid: Some(Uuid::new_v4()),
            source_device: Some(2),
            destination_uuid: Uuid::new_v4(),
            destination_device: 3,
            content: Some(vec![9, 9]),
        };

        let row = MessageRow {
            account_uuid: env.destination_uuid.to_string(),
            device_id: env.destination_device,
            server_ts: env.server_timestamp,
            guid: env.guid.to_string(),
            kind: env.kind.code(),
            client_ts: env.client_timestamp,
            source_uuid: env.source_uuid.map(|u| u.to_string()),
            source_device: env.source_device,
            content: env.content.clone(),
            expires_at: 999,
        };

        assert_eq!(try_envelope_from_row(row).unwrap(), env);
    }

    #[test]
    fn corrupt_row_is_rejected() {
        let row = MessageRow {
            account_uuid: "not-a-uuid".into(),
            device_id: 1,
            server_ts: 1,
            guid: Uuid::new_v4().to_string(),
            kind: 1,
            client_ts: 1,
            source_uuid: None,
            source_device: None,
            content: None,
            expires_at: 1,
        };
        assert!(try_envelope_from_row(row).is_err());

        let bad_kind = MessageRow {
            account_uuid: Uuid::new_v4().to_string(),
            device_id: 1,
            server_ts: 1,
            guid: Uuid::new_v4().to_string(),
            kind: 99,
            client_ts: 1,
            source_uuid: None,
            source_device: None,
            content: None,
            expires_at: 1,
        };
        assert!(try_envelope_from_row(bad_kind).is_err());
    }
}
