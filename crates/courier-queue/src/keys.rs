use courier_types::DeviceAddress;
use uuid::Uuid;

/// Cache key layout for one device queue. The four per-queue keys embed the
/// same `{account::device}` hash tag so they co-locate on one shard and can
/// be manipulated by a single atomic script.

pub fn queue_key(addr: &DeviceAddress) -> String {
    format!("user_queue::{{{addr}}}")
}

pub fn queue_metadata_key(addr: &DeviceAddress) -> String {
    format!("user_queue_metadata::{{{addr}}}")
}

pub fn queue_counter_key(addr: &DeviceAddress) -> String {
    format!("user_queue_counter::{{{addr}}}")
}

pub fn persist_in_progress_key(addr: &DeviceAddress) -> String {
    format!("user_queue_persist_in_progress::{{{addr}}}")
}

/// PUBLISH target for queue wake events (`new`, `persisted`,
/// `ephemeral:<json>`). Shares the queue's hash tag so the event is emitted
/// on the shard the subscriber watches.
pub fn queue_events_channel(addr: &DeviceAddress) -> String {
    format!("queue_events::{{{addr}}}")
}

pub const QUEUE_EVENTS_PATTERN: &str = "queue_events::*";

/// Per-shard enumeration of queues holding unpersisted messages, scored by
/// the insert time of their oldest pending envelope. Lives on the shard of
/// the queues it indexes, not on the shard its own name hashes to.
pub fn shard_index_key(shard: usize) -> String {
    format!("persist_queue_index::{{{shard}}}")
}

pub fn persist_lease_key(shard: usize) -> String {
    format!("persist_lease::{{{shard}}}")
}

/// Cursor the persister increments to pick the next shard to drain.
pub const PERSIST_CURSOR_KEY: &str = "persist_shard_cursor";

pub fn parse_queue_key(key: &str) -> Option<DeviceAddress> {
    parse_tagged(key, "user_queue::")
}

pub fn parse_queue_events_channel(channel: &str) -> Option<DeviceAddress> {
    parse_tagged(channel, "queue_events::")
}

fn parse_tagged(value: &str, prefix: &str) -> Option<DeviceAddress> {
    let tag = value
        .strip_prefix(prefix)?
        .strip_prefix('{')?
        .strip_suffix('}')?;
    let (account, device) = tag.split_once("::")?;
    Some(DeviceAddress {
        account: account.parse::<Uuid>().ok()?,
        device_id: device.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> DeviceAddress {
        DeviceAddress::new("f1e0a788-0f27-4abf-8f31-6a979a6f9d72".parse().unwrap(), 3)
    }

    #[test]
    fn queue_keys_share_one_hash_tag() {
        let addr = addr();
        let tag = format!("{{{addr}}}");
        for key in [
            queue_key(&addr),
            queue_metadata_key(&addr),
            queue_counter_key(&addr),
            persist_in_progress_key(&addr),
            queue_events_channel(&addr),
        ] {
            assert!(key.ends_with(&tag), "{key} missing tag {tag}");
        }
    }

    #[test]
    fn queue_key_roundtrip() {
        let addr = addr();
        assert_eq!(parse_queue_key(&queue_key(&addr)), Some(addr));
        assert_eq!(
            parse_queue_events_channel(&queue_events_channel(&addr)),
            Some(addr)
        );
    }

    #[test]
    fn parse_rejects_foreign_keys() {
        assert_eq!(parse_queue_key("user_queue_metadata::{x::1}"), None);
        assert_eq!(parse_queue_key("user_queue::{not-a-uuid::1}"), None);
        assert_eq!(parse_queue_key("user_queue::{f1e0a788-0f27-4abf-8f31-6a979a6f9d72::x}"), None);
    }
}
