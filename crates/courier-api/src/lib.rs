pub mod limits;
pub mod messages;
pub mod middleware;

use std::sync::Arc;

use courier_gateway::MessageSender;
use courier_queue::MessagesManager;
use courier_types::accounts::AccountDirectory;
use courier_types::metrics::Metrics;

use crate::limits::MessageRateLimiter;

pub type ApiState = Arc<ApiStateInner>;

pub struct ApiStateInner {
    pub directory: Arc<dyn AccountDirectory>,
    pub manager: Arc<MessagesManager>,
    pub sender: Arc<MessageSender>,
    pub limiter: MessageRateLimiter,
    pub metrics: Arc<Metrics>,
}
