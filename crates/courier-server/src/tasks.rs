use std::sync::Arc;
use std::time::Duration;

use courier_db::Database;
use courier_gateway::{LocalDispatcher, PresenceManager, PRESENCE_REFRESH_INTERVAL};
use courier_queue::now_ms;
use tracing::{info, warn};

/// Background task that prunes messages past their retention window.
///
/// Runs on an interval and deletes rows whose `expires_at` has lapsed;
/// clients that stayed offline that long re-sync through other means.
pub async fn run_retention_sweep(db: Arc<Database>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let db = Arc::clone(&db);
        let swept = tokio::task::spawn_blocking(move || db.delete_expired(now_ms())).await;
        match swept {
            Ok(Ok(count)) if count > 0 => {
                info!("retention sweep pruned {} expired messages", count);
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("retention sweep failed: {}", e),
            Err(e) => warn!("retention sweep task failed: {}", e),
        }
    }
}

/// Keeps presence records alive for every socket this instance still holds.
/// Records that stop being refreshed expire on their own TTL.
pub async fn run_presence_heartbeat(presence: Arc<PresenceManager>, dispatcher: LocalDispatcher) {
    let mut ticker = tokio::time::interval(PRESENCE_REFRESH_INTERVAL);
    // Skip the immediate first tick
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let addrs = dispatcher.local_addresses();
        if !addrs.is_empty() {
            presence.refresh(&addrs).await;
        }
    }
}
