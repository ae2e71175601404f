pub mod provider;
pub mod scheduler;

pub use provider::{ApnSender, FcmSender, PushOutcome, PushSender, WakeNotification};
pub use scheduler::{PushConfig, PushScheduler, PushWorker};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}
