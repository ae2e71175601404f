use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::envelope::DeviceAddress;

/// Internal counters for the delivery pipeline, passed explicitly into each
/// component at construction. Exported as a text block by the status
/// endpoint; no external metrics backend is involved.
#[derive(Default)]
pub struct Metrics {
    pub messages_inserted: AtomicU64,
    pub messages_persisted: AtomicU64,
    pub queues_persisted: AtomicU64,
    pub corrupt_envelopes: AtomicU64,
    pub sender_scans_truncated: AtomicU64,
    pub pushes_scheduled: AtomicU64,
    pub pushes_sent: AtomicU64,
    pub push_failures: AtomicU64,
    pub push_tokens_invalidated: AtomicU64,
    pub sessions_connected: AtomicU64,
    pub sessions_displaced: AtomicU64,

    /// When a queue went from empty to non-empty, per queue. Cleared when the
    /// device connects and flushes; the delta is the push wake latency.
    queue_activated_at: Mutex<HashMap<DeviceAddress, u64>>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_queue_activated(&self, addr: DeviceAddress, now_ms: u64) {
        self.queue_activated_at.lock().entry(addr).or_insert(now_ms);
    }

    /// Takes the activation timestamp for a queue, if one was recorded since
    /// it last drained.
    pub fn take_queue_activation(&self, addr: &DeviceAddress) -> Option<u64> {
        self.queue_activated_at.lock().remove(addr)
    }

    pub fn render(&self) -> String {
        format!(
            "messages_inserted {}\nmessages_persisted {}\nqueues_persisted {}\n\
             corrupt_envelopes {}\nsender_scans_truncated {}\npushes_scheduled {}\n\
             pushes_sent {}\npush_failures {}\npush_tokens_invalidated {}\n\
             sessions_connected {}\nsessions_displaced {}\n",
            self.messages_inserted.load(Ordering::Relaxed),
            self.messages_persisted.load(Ordering::Relaxed),
            self.queues_persisted.load(Ordering::Relaxed),
            self.corrupt_envelopes.load(Ordering::Relaxed),
            self.sender_scans_truncated.load(Ordering::Relaxed),
            self.pushes_scheduled.load(Ordering::Relaxed),
            self.pushes_sent.load(Ordering::Relaxed),
            self.push_failures.load(Ordering::Relaxed),
            self.push_tokens_invalidated.load(Ordering::Relaxed),
            self.sessions_connected.load(Ordering::Relaxed),
            self.sessions_displaced.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn queue_activation_is_recorded_once_and_taken_once() {
        let metrics = Metrics::new();
        let addr = DeviceAddress::new(Uuid::new_v4(), 1);

        metrics.record_queue_activated(addr, 100);
        // A second insert into a still-populated queue keeps the original mark.
        metrics.record_queue_activated(addr, 200);

        assert_eq!(metrics.take_queue_activation(&addr), Some(100));
        assert_eq!(metrics.take_queue_activation(&addr), None);
    }
}
