use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;

/// Runtime configuration, assembled from the environment (a `.env` file is
/// honored). Only `COURIER_JWT_SECRET` is mandatory.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    /// Comma-separated cache shard endpoints.
    pub cache_urls: Vec<String>,
    pub db_path: PathBuf,
    /// Identity of this instance in presence records and leases.
    pub server_id: String,
    pub persist_delay: Duration,
    /// How long persisted messages are retained before the TTL sweep.
    pub message_retention: Duration,
    pub rate_limit_per_minute: u32,
    pub apn: Option<ApnConfig>,
    pub fcm: Option<FcmConfig>,
}

#[derive(Debug, Clone)]
pub struct ApnConfig {
    pub endpoint: String,
    pub bearer_token: String,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct FcmConfig {
    pub endpoint: String,
    pub server_key: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("COURIER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = std::env::var("COURIER_PORT")
            .unwrap_or_else(|_| "3200".into())
            .parse()?;

        let jwt_secret = std::env::var("COURIER_JWT_SECRET").unwrap_or_default();

        let cache_urls: Vec<String> = std::env::var("COURIER_CACHE_URLS")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let db_path: PathBuf = std::env::var("COURIER_DB_PATH")
            .unwrap_or_else(|_| "courier-messages.db".into())
            .into();

        // Fresh per boot unless pinned; presence and leases key off it.
        let server_id =
            std::env::var("COURIER_SERVER_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());

        let persist_delay = Duration::from_secs(
            std::env::var("COURIER_PERSIST_DELAY_SECS")
                .unwrap_or_else(|_| "600".into())
                .parse()?,
        );
        let message_retention = Duration::from_secs(
            std::env::var("COURIER_RETENTION_SECS")
                .unwrap_or_else(|_| (7 * 24 * 3600).to_string())
                .parse()?,
        );
        let rate_limit_per_minute: u32 = std::env::var("COURIER_SEND_RATE_PER_MINUTE")
            .unwrap_or_else(|_| "6000".into())
            .parse()?;

        let apn = match std::env::var("COURIER_APN_BEARER_TOKEN") {
            Ok(bearer_token) if !bearer_token.is_empty() => Some(ApnConfig {
                endpoint: std::env::var("COURIER_APN_ENDPOINT")
                    .unwrap_or_else(|_| "https://api.push.apple.com".into()),
                bearer_token,
                topic: std::env::var("COURIER_APN_TOPIC").unwrap_or_default(),
            }),
            _ => None,
        };

        let fcm = match std::env::var("COURIER_FCM_SERVER_KEY") {
            Ok(server_key) if !server_key.is_empty() => Some(FcmConfig {
                endpoint: std::env::var("COURIER_FCM_ENDPOINT")
                    .unwrap_or_else(|_| "https://fcm.googleapis.com/fcm/send".into()),
                server_key,
            }),
            _ => None,
        };

        Ok(Self {
            host,
            port,
            jwt_secret,
            cache_urls,
            db_path,
            server_id,
            persist_delay,
            message_retention,
            rate_limit_per_minute,
            apn,
            fcm,
        })
    }
}
