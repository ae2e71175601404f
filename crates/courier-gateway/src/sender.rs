use std::sync::Arc;

use anyhow::Result;
use courier_push::PushScheduler;
use courier_queue::{now_ms, MessagesManager};
use courier_types::accounts::Device;
use courier_types::Envelope;
use tracing::{debug, warn};

use crate::dispatcher::LocalDispatcher;
use crate::presence::{PresenceLocation, PresenceManager};

/// How the sender routed one envelope; surfaced for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    DeliveredInProcess,
    PublishedEphemeral,
    DroppedOffline,
    Enqueued,
    EnqueuedWithPush,
}

/// Policy engine deciding between live delivery and store-for-later.
///
/// `online` envelopes are best-effort: delivered through a live socket or
/// dropped. Everything else lands in the device queue; the insert script's
/// wake event reaches whichever instance holds the socket, and an absent
/// device gets a platform push scheduled.
pub struct MessageSender {
    dispatcher: LocalDispatcher,
    presence: Arc<PresenceManager>,
    manager: Arc<MessagesManager>,
    push: Arc<PushScheduler>,
}

impl MessageSender {
    pub fn new(
        dispatcher: LocalDispatcher,
        presence: Arc<PresenceManager>,
        manager: Arc<MessagesManager>,
        push: Arc<PushScheduler>,
    ) -> Self {
        Self {
            dispatcher,
            presence,
            manager,
            push,
        }
    }

    pub async fn send(&self, device: &Device, envelope: Envelope, online: bool) -> Result<SendOutcome> {
        let addr = envelope.destination();

        if online {
            // The in-process registry is authoritative for "present here";
            // the shared record may lag behind a just-closed socket.
            if self.dispatcher.deliver(&addr, envelope.clone()) {
                return Ok(SendOutcome::DeliveredInProcess);
            }
            return match self.presence.locate(&addr).await? {
                PresenceLocation::Elsewhere(_) => {
                    self.manager.cache().publish_ephemeral(&addr, &envelope).await?;
                    Ok(SendOutcome::PublishedEphemeral)
                }
                PresenceLocation::Local | PresenceLocation::Absent => {
                    // A stale "local" record with no socket is treated as
                    // absent. Online messages to absent devices are dropped.
                    debug!("dropping online message for offline {}", addr);
                    Ok(SendOutcome::DroppedOffline)
                }
            };
        }

        self.manager.insert(&envelope).await?;
        // The insert's wake event already reaches any live socket holder,
        // local or remote. Only an absent device needs the push ladder.
        match self.presence.locate(&addr).await? {
            PresenceLocation::Local | PresenceLocation::Elsewhere(_) => Ok(SendOutcome::Enqueued),
            PresenceLocation::Absent => {
                if device.supports_push() {
                    if let Err(e) = self.push.schedule(&addr, now_ms()).await {
                        // The message is stored; the wake is best-effort.
                        warn!("failed to schedule push for {}: {}", addr, e);
                        return Ok(SendOutcome::Enqueued);
                    }
                    Ok(SendOutcome::EnqueuedWithPush)
                } else {
                    Ok(SendOutcome::Enqueued)
                }
            }
        }
    }
}
