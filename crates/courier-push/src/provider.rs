use async_trait::async_trait;
use tracing::{debug, warn};

use courier_types::DeviceAddress;

/// Provider response, collapsed to what the retry ladder cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The provider no longer recognizes the token; stop using it.
    InvalidToken,
    /// Network fault or provider-side overload; retry later.
    Transient,
}

/// A content-free wake notification. The payload never carries message data;
/// it only tells the device to connect and drain its queue.
#[derive(Debug, Clone)]
pub struct WakeNotification {
    pub destination: DeviceAddress,
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, token: &str, notification: &WakeNotification) -> PushOutcome;
}

/// APNs HTTP/2 sender. Authentication uses a provider bearer token; the
/// notification is a background push so iOS wakes the app without UI.
pub struct ApnSender {
    http: reqwest::Client,
    endpoint: String,
    bearer_token: String,
    topic: String,
}

impl ApnSender {
    pub fn new(endpoint: String, bearer_token: String, topic: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            bearer_token,
            topic,
        }
    }
}

#[async_trait]
impl PushSender for ApnSender {
    async fn send(&self, token: &str, notification: &WakeNotification) -> PushOutcome {
        let url = format!("{}/3/device/{}", self.endpoint, token);
        let body = serde_json::json!({
            "aps": {
                "content-available": 1
            }
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.bearer_token)
            .header("apns-topic", &self.topic)
            .header("apns-push-type", "background")
            .header("apns-priority", "5")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                debug!("apn wake delivered for {}", notification.destination);
                PushOutcome::Delivered
            }
            Ok(resp) if resp.status() == reqwest::StatusCode::GONE => PushOutcome::InvalidToken,
            Ok(resp) if resp.status().is_client_error() => {
                let status = resp.status();
                let reason = resp.text().await.unwrap_or_default();
                if reason.contains("BadDeviceToken") || reason.contains("Unregistered") {
                    PushOutcome::InvalidToken
                } else {
                    warn!("apn rejected wake ({}): {}", status, reason);
                    PushOutcome::Transient
                }
            }
            Ok(resp) => {
                warn!("apn send failed with status {}", resp.status());
                PushOutcome::Transient
            }
            Err(e) => {
                warn!("apn send failed: {}", e);
                PushOutcome::Transient
            }
        }
    }
}

/// FCM sender using server-key auth.
pub struct FcmSender {
    http: reqwest::Client,
    endpoint: String,
    server_key: String,
}

impl FcmSender {
    pub fn new(endpoint: String, server_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            server_key,
        }
    }
}

#[async_trait]
impl PushSender for FcmSender {
    async fn send(&self, token: &str, notification: &WakeNotification) -> PushOutcome {
        let body = serde_json::json!({
            "to": token,
            "priority": "high",
            "data": { "notification": "" }
        });

        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let parsed: serde_json::Value = match resp.json().await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("fcm response unreadable: {}", e);
                        return PushOutcome::Transient;
                    }
                };
                let error = parsed["results"][0]["error"].as_str().unwrap_or("");
                match error {
                    "" => {
                        debug!("fcm wake delivered for {}", notification.destination);
                        PushOutcome::Delivered
                    }
                    "NotRegistered" | "InvalidRegistration" | "MismatchSenderId" => {
                        PushOutcome::InvalidToken
                    }
                    other => {
                        warn!("fcm rejected wake: {}", other);
                        PushOutcome::Transient
                    }
                }
            }
            Ok(resp) => {
                warn!("fcm send failed with status {}", resp.status());
                PushOutcome::Transient
            }
            Err(e) => {
                warn!("fcm send failed: {}", e);
                PushOutcome::Transient
            }
        }
    }
}
