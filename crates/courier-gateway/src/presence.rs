use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use courier_cache::{CacheCluster, CacheError, ClusterScript, KeyspaceSubscriber};
use courier_types::metrics::Metrics;
use courier_types::DeviceAddress;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Presence record TTL. A record that stops being refreshed (crashed
/// instance, dead socket) disappears on its own within this window.
const PRESENCE_TTL: Duration = Duration::from_secs(660);

/// Heartbeat cadence for refreshing the records of locally held sockets.
pub const PRESENCE_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// KEYS: [presence]
/// ARGV: [server_id, ttl_secs, channel]
/// Sets the record unconditionally; when a different instance held it,
/// announces the displacement (tagged with the new holder) on the pair's
/// presence channel.
const SET_PRESENT: &str = r#"
local prior = redis.call("GET", KEYS[1])
redis.call("SET", KEYS[1], ARGV[1], "EX", ARGV[2])
if prior and prior ~= ARGV[1] then
    redis.call("PUBLISH", ARGV[3], "displaced:" .. ARGV[1])
end
return prior or ""
"#;

/// KEYS: [presence]
/// ARGV: [server_id]
/// Compare-and-delete: only the current holder may clear the record.
const CLEAR_IF_HELD: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("DEL", KEYS[1])
    return 1
end
return 0
"#;

/// KEYS: [presence]
/// ARGV: [server_id, ttl_secs]
/// Refreshes the TTL only while we still hold the record.
const REFRESH_IF_HELD: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("EXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

/// Where a device's socket currently lives, from this instance's viewpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceLocation {
    Local,
    Elsewhere(String),
    Absent,
}

fn presence_key(addr: &DeviceAddress) -> String {
    format!("presence::{}::{}", addr.account, addr.device_id)
}

fn presence_channel(addr: &DeviceAddress) -> String {
    format!("presence_events::{}::{}", addr.account, addr.device_id)
}

const PRESENCE_EVENTS_PATTERN: &str = "presence_events::*";
const EXPIRED_EVENTS_PATTERN: &str = "__keyevent@*__:expired";

fn parse_presence_suffix(suffix: &str) -> Option<DeviceAddress> {
    let (account, device) = suffix.split_once("::")?;
    Some(DeviceAddress {
        account: account.parse::<Uuid>().ok()?,
        device_id: device.parse().ok()?,
    })
}

/// Cluster-wide registry mapping (account, device) to the instance holding
/// its socket. Records carry a TTL and are refreshed while the socket lives;
/// displacement and expiry both surface as events the owning instance routes
/// to its local session.
pub struct PresenceManager {
    cluster: Arc<CacheCluster>,
    server_id: String,
    set_script: ClusterScript,
    clear_script: ClusterScript,
    refresh_script: ClusterScript,
}

impl PresenceManager {
    pub fn new(cluster: Arc<CacheCluster>, server_id: String) -> Self {
        Self {
            cluster,
            server_id,
            set_script: ClusterScript::new(SET_PRESENT),
            clear_script: ClusterScript::new(CLEAR_IF_HELD),
            refresh_script: ClusterScript::new(REFRESH_IF_HELD),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Claims the presence record for this instance. The previous holder, if
    /// different, learns about it via the displacement event.
    pub async fn set_present(&self, addr: &DeviceAddress) -> Result<(), CacheError> {
        let key = presence_key(addr);
        let prior: String = self
            .cluster
            .run_script(
                &self.set_script,
                &key,
                &[key.clone()],
                &[
                    self.server_id.clone(),
                    PRESENCE_TTL.as_secs().to_string(),
                    presence_channel(addr),
                ],
            )
            .await?;
        if !prior.is_empty() && prior != self.server_id {
            debug!("displaced {} from {}", addr, prior);
        }
        Ok(())
    }

    /// Resolves where the device is connected right now. The answer can be
    /// stale by at most the TTL-refresh gap; callers tolerate that because
    /// queue wake events reach whoever actually holds the socket.
    pub async fn locate(&self, addr: &DeviceAddress) -> Result<PresenceLocation, CacheError> {
        match self.cluster.get(&presence_key(addr)).await? {
            Some(holder) if holder == self.server_id => Ok(PresenceLocation::Local),
            Some(holder) => Ok(PresenceLocation::Elsewhere(holder)),
            None => Ok(PresenceLocation::Absent),
        }
    }

    /// Releases the record if this instance still holds it. A successor's
    /// record is left untouched.
    pub async fn clear_presence(&self, addr: &DeviceAddress) -> Result<bool, CacheError> {
        let key = presence_key(addr);
        let cleared: i64 = self
            .cluster
            .run_script(
                &self.clear_script,
                &key,
                &[key.clone()],
                &[self.server_id.clone()],
            )
            .await?;
        Ok(cleared == 1)
    }

    /// Refreshes the TTL of every address still connected here. Run from a
    /// periodic task.
    pub async fn refresh(&self, addrs: &[DeviceAddress]) {
        for addr in addrs {
            let key = presence_key(addr);
            let refreshed: Result<i64, _> = self
                .cluster
                .run_script(
                    &self.refresh_script,
                    &key,
                    &[key.clone()],
                    &[self.server_id.clone(), PRESENCE_TTL.as_secs().to_string()],
                )
                .await;
            match refreshed {
                Ok(0) => debug!("presence for {} no longer held here", addr),
                Ok(_) => {}
                Err(e) => warn!("presence refresh failed for {}: {}", addr, e),
            }
        }
    }

    /// Subscribes to displacement and expiry events across all shards and
    /// routes them into `on_displaced`. Call once at startup.
    pub fn start_displacement_dispatch(
        self: &Arc<Self>,
        metrics: Arc<Metrics>,
        on_displaced: Arc<dyn Fn(DeviceAddress) + Send + Sync>,
    ) -> Vec<JoinHandle<()>> {
        let subscriber = KeyspaceSubscriber::new(self.cluster.pubsub_clients());
        let server_id = self.server_id.clone();
        info!("presence displacement dispatch started for {}", server_id);

        subscriber.spawn(
            vec![
                PRESENCE_EVENTS_PATTERN.to_string(),
                EXPIRED_EVENTS_PATTERN.to_string(),
            ],
            Arc::new(move |channel, payload| {
                if let Some(suffix) = channel.strip_prefix("presence_events::") {
                    let Some(addr) = parse_presence_suffix(suffix) else {
                        return;
                    };
                    // Same-instance displacement is handled in-process by the
                    // dispatcher; only a takeover by another instance matters.
                    if let Some(new_holder) = payload.strip_prefix("displaced:") {
                        if new_holder != server_id {
                            metrics.sessions_displaced.fetch_add(1, Ordering::Relaxed);
                            on_displaced(addr);
                        }
                    }
                } else if channel.contains(":expired") {
                    // Keyspace expiry: payload is the expired key.
                    if let Some(suffix) = payload.strip_prefix("presence::") {
                        if let Some(addr) = parse_presence_suffix(suffix) {
                            on_displaced(addr);
                        }
                    }
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_key_layout() {
        let addr = DeviceAddress::new("f1e0a788-0f27-4abf-8f31-6a979a6f9d72".parse().unwrap(), 2);
        assert_eq!(
            presence_key(&addr),
            "presence::f1e0a788-0f27-4abf-8f31-6a979a6f9d72::2"
        );
        assert_eq!(
            parse_presence_suffix("f1e0a788-0f27-4abf-8f31-6a979a6f9d72::2"),
            Some(addr)
        );
        assert_eq!(parse_presence_suffix("nope"), None);
    }
}
