use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courier_types::{DeviceAddress, Envelope};
use dashmap::DashMap;
use tokio::sync::mpsc;

/// In-process signals delivered to one session's select loop.
#[derive(Debug)]
pub enum SessionSignal {
    /// An envelope handed over in-process because the recipient's socket
    /// lives on this instance.
    Deliver(Box<Envelope>),
    /// A newer session took over this (account, device); close with the
    /// "replaced" code.
    Displaced,
}

struct SessionHandle {
    conn_id: u64,
    tx: mpsc::UnboundedSender<SessionSignal>,
}

/// Registry of sessions connected to this instance.
///
/// Registration is last-writer-wins: a second socket for the same
/// (account, device) displaces the first in-process, mirroring what the
/// presence registry does across instances.
#[derive(Clone, Default)]
pub struct LocalDispatcher {
    inner: Arc<DashMap<DeviceAddress, SessionHandle>>,
    next_conn_id: Arc<AtomicU64>,
}

impl LocalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session and returns its connection id plus the signal
    /// receiver. Any prior session for the same address is told to close.
    pub fn register(&self, addr: DeviceAddress) -> (u64, mpsc::UnboundedReceiver<SessionSignal>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(previous) = self.inner.insert(addr, SessionHandle { conn_id, tx }) {
            let _ = previous.tx.send(SessionSignal::Displaced);
        }
        (conn_id, rx)
    }

    /// Removes the registration, but only when it still belongs to
    /// `conn_id`; a displaced session must not tear down its successor.
    /// Returns whether the caller was still the current holder.
    pub fn unregister(&self, addr: &DeviceAddress, conn_id: u64) -> bool {
        self.inner
            .remove_if(addr, |_, handle| handle.conn_id == conn_id)
            .is_some()
    }

    pub fn is_local(&self, addr: &DeviceAddress) -> bool {
        self.inner.contains_key(addr)
    }

    /// Hands an envelope to the local session. `false` means no session is
    /// registered (or it is shutting down) and the caller must fall back.
    pub fn deliver(&self, addr: &DeviceAddress, envelope: Envelope) -> bool {
        match self.inner.get(addr) {
            Some(handle) => handle
                .tx
                .send(SessionSignal::Deliver(Box::new(envelope)))
                .is_ok(),
            None => false,
        }
    }

    /// Signals displacement from a cross-instance event.
    pub fn displace(&self, addr: &DeviceAddress) {
        if let Some(handle) = self.inner.get(addr) {
            let _ = handle.tx.send(SessionSignal::Displaced);
        }
    }

    /// Addresses of every session on this instance, for presence refresh.
    pub fn local_addresses(&self) -> Vec<DeviceAddress> {
        self.inner.iter().map(|entry| *entry.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn addr() -> DeviceAddress {
        DeviceAddress::new(Uuid::new_v4(), 1)
    }

    #[tokio::test]
    async fn second_registration_displaces_first() {
        let dispatcher = LocalDispatcher::new();
        let addr = addr();

        let (first_id, mut first_rx) = dispatcher.register(addr);
        let (second_id, _second_rx) = dispatcher.register(addr);
        assert_ne!(first_id, second_id);

        match first_rx.recv().await {
            Some(SessionSignal::Displaced) => {}
            other => panic!("expected displacement, got {:?}", other),
        }

        // The displaced session's cleanup must not evict the new one.
        assert!(!dispatcher.unregister(&addr, first_id));
        assert!(dispatcher.is_local(&addr));
        assert!(dispatcher.unregister(&addr, second_id));
        assert!(!dispatcher.is_local(&addr));
    }

    #[tokio::test]
    async fn deliver_reaches_registered_session() {
        let dispatcher = LocalDispatcher::new();
        let addr = addr();
        let (_, mut rx) = dispatcher.register(addr);

        let envelope = Envelope {
            guid: Uuid::new_v4(),
            kind: courier_types::EnvelopeKind::Ciphertext,
            client_timestamp: 1,
            server_timestamp: 2,
            source_uuid: None,
            source_device: None,
            destination_uuid: addr.account,
            destination_device: addr.device_id,
            content: None,
        };
        assert!(dispatcher.deliver(&addr, envelope.clone()));

        match rx.recv().await {
            Some(SessionSignal::Deliver(delivered)) => assert_eq!(*delivered, envelope),
            other => panic!("expected delivery, got {:?}", other),
        }

        assert!(!dispatcher.deliver(&DeviceAddress::new(Uuid::new_v4(), 1), envelope));
    }
}
