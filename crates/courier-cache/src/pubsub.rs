use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handler for one pub/sub event: `(channel, payload)`.
pub type EventHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Delay between reconnect attempts when a pub/sub connection drops.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Pattern subscriptions across every cache shard.
///
/// Publishes land on the shard that owns the channel's hash tag, so a
/// cluster-wide subscription needs one pub/sub connection per shard. Each
/// connection runs on its own task; a dropped connection is re-established
/// and re-subscribed automatically.
pub struct KeyspaceSubscriber {
    clients: Vec<redis::Client>,
}

impl KeyspaceSubscriber {
    pub fn new(clients: Vec<redis::Client>) -> Self {
        Self { clients }
    }

    /// Subscribes `patterns` on every shard and dispatches each received
    /// event to `handler` on the subscription task. Returns one task handle
    /// per shard; dropping them does not cancel the subscriptions.
    pub fn spawn(&self, patterns: Vec<String>, handler: EventHandler) -> Vec<JoinHandle<()>> {
        self.clients
            .iter()
            .enumerate()
            .map(|(shard, client)| {
                let client = client.clone();
                let patterns = patterns.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    subscription_loop(shard, client, patterns, handler).await;
                })
            })
            .collect()
    }
}

async fn subscription_loop(
    shard: usize,
    client: redis::Client,
    patterns: Vec<String>,
    handler: EventHandler,
) {
    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                warn!("shard {} pub/sub connect failed: {}", shard, e);
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                continue;
            }
        };

        let mut subscribed = true;
        for pattern in &patterns {
            if let Err(e) = pubsub.psubscribe(pattern).await {
                warn!("shard {} psubscribe {} failed: {}", shard, pattern, e);
                subscribed = false;
                break;
            }
        }
        if !subscribed {
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            continue;
        }

        info!("shard {} subscribed to {} patterns", shard, patterns.len());

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    debug!("shard {} dropped non-utf8 event on {}: {}", shard, channel, e);
                    continue;
                }
            };
            handler(&channel, &payload);
        }

        // Stream ended: the connection is gone. Reconnect and re-subscribe.
        warn!("shard {} pub/sub connection lost, resubscribing", shard);
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}
