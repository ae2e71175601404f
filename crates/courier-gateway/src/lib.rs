pub mod connection;
pub mod dispatcher;
pub mod presence;
pub mod sender;
pub mod session;

use std::sync::Arc;

use courier_push::PushScheduler;
use courier_queue::MessagesManager;
use courier_types::metrics::Metrics;

pub use dispatcher::{LocalDispatcher, SessionSignal};
pub use presence::{PresenceLocation, PresenceManager, PRESENCE_REFRESH_INTERVAL};
pub use sender::{MessageSender, SendOutcome};

/// Everything a WebSocket session needs, wired once at startup.
#[derive(Clone)]
pub struct GatewayContext {
    pub dispatcher: LocalDispatcher,
    pub presence: Arc<PresenceManager>,
    pub manager: Arc<MessagesManager>,
    pub push: Arc<PushScheduler>,
    pub metrics: Arc<Metrics>,
    pub jwt_secret: String,
}
