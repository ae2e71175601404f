use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One registered device of an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: u8,
    pub registration_id: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub apn_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fcm_token: Option<String>,
    /// Long-poll style client with no native push channel; never push-notified.
    #[serde(default)]
    pub fetches_messages: bool,
}

impl Device {
    /// A device is reachable by push when it carries a token and has not
    /// opted into fetch-style delivery.
    pub fn supports_push(&self) -> bool {
        !self.fetches_messages && (self.apn_token.is_some() || self.fcm_token.is_some())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub uuid: Uuid,
    pub devices: Vec<Device>,
}

impl Account {
    pub fn device(&self, device_id: u8) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == device_id)
    }

    pub fn device_ids(&self) -> Vec<u8> {
        self.devices.iter().map(|d| d.id).collect()
    }
}

/// Account/device lookup, owned by the (out-of-scope) account subsystem.
/// The delivery pipeline only reads device sets and mutates push tokens
/// when a provider reports them permanently invalid.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn get(&self, account: Uuid) -> Option<Account>;

    /// Clear a device's push token after the provider rejected it as
    /// invalid or the retry ladder was exhausted.
    async fn clear_push_token(&self, account: Uuid, device_id: u8);
}

/// Process-local directory used by the server wiring and tests.
#[derive(Default)]
pub struct InMemoryAccountDirectory {
    accounts: RwLock<HashMap<Uuid, Account>>,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, account: Account) {
        self.accounts.write().insert(account.uuid, account);
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn get(&self, account: Uuid) -> Option<Account> {
        self.accounts.read().get(&account).cloned()
    }

    async fn clear_push_token(&self, account: Uuid, device_id: u8) {
        if let Some(account) = self.accounts.write().get_mut(&account) {
            if let Some(device) = account.devices.iter_mut().find(|d| d.id == device_id) {
                device.apn_token = None;
                device.fcm_token = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clear_push_token_removes_both_tokens() {
        let directory = InMemoryAccountDirectory::new();
        let uuid = Uuid::new_v4();
        directory.put(Account {
            uuid,
            devices: vec![Device {
                id: 1,
                registration_id: 42,
                apn_token: Some("apn".into()),
                fcm_token: Some("fcm".into()),
                fetches_messages: false,
            }],
        });

        directory.clear_push_token(uuid, 1).await;

        let account = directory.get(uuid).await.unwrap();
        let device = account.device(1).unwrap();
        assert!(device.apn_token.is_none());
        assert!(device.fcm_token.is_none());
        assert!(!device.supports_push());
    }
}
