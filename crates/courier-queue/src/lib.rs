pub mod cache;
pub mod keys;
pub mod manager;
pub mod persister;
pub mod scripts;

pub use cache::MessagesCache;
pub use manager::MessagesManager;
pub use persister::{MessagePersister, PersisterConfig};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}
