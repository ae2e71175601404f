use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of an opaque envelope. The server never looks inside the
/// content; the kind only drives client-side decryption dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Ciphertext,
    KeyExchange,
    PrekeyBundle,
    Receipt,
    UnidentifiedSender,
}

impl EnvelopeKind {
    /// Stable numeric code used in the durable table.
    pub fn code(self) -> i64 {
        match self {
            Self::Ciphertext => 1,
            Self::KeyExchange => 2,
            Self::PrekeyBundle => 3,
            Self::Receipt => 5,
            Self::UnidentifiedSender => 6,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Ciphertext),
            2 => Some(Self::KeyExchange),
            3 => Some(Self::PrekeyBundle),
            5 => Some(Self::Receipt),
            6 => Some(Self::UnidentifiedSender),
            _ => None,
        }
    }
}

/// A single opaque message unit addressed to one recipient device.
///
/// `guid` and `server_timestamp` are assigned exactly once, when the message
/// sender first accepts the envelope; they never change afterwards. For
/// sealed-sender envelopes `source_uuid` and `source_device` are absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub guid: Uuid,
    pub kind: EnvelopeKind,
    /// Client-supplied timestamp (ms since epoch).
    pub client_timestamp: u64,
    /// Server-assigned timestamp (ms since epoch), monotonic within a queue.
    pub server_timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_device: Option<u8>,
    pub destination_uuid: Uuid,
    pub destination_device: u8,
    /// Opaque ciphertext payload, base64 on the wire. Absent for some
    /// receipt envelopes.
    #[serde(
        with = "base64_content",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub content: Option<Vec<u8>>,
}

mod base64_content {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

impl Envelope {
    pub fn destination(&self) -> DeviceAddress {
        DeviceAddress {
            account: self.destination_uuid,
            device_id: self.destination_device,
        }
    }

    /// True when the sender identity is encrypted inside the payload and
    /// invisible to the server.
    pub fn is_sealed_sender(&self) -> bool {
        self.source_uuid.is_none()
    }
}

/// Identifies one device queue: the (account, device) pair every delivery
/// decision is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub account: Uuid,
    pub device_id: u8,
}

impl DeviceAddress {
    pub fn new(account: Uuid, device_id: u8) -> Self {
        Self { account, device_id }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.account, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            guid: Uuid::new_v4(),
            kind: EnvelopeKind::Ciphertext,
            client_timestamp: 1_700_000_000_000,
            server_timestamp: 1_700_000_000_123,
            source_uuid: Some(Uuid::new_v4()),
            source_device: Some(1),
            destination_uuid: Uuid::new_v4(),
            destination_device: 2,
            content: Some(vec![1, 2, 3]),
        }
    }

    #[test]
    fn serde_roundtrip() {
        let env = envelope();
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn content_is_base64_on_the_wire() {
        let env = envelope();
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"AQID\""), "payload not base64: {json}");
    }

    #[test]
    fn sealed_sender_omits_source_fields() {
        let mut env = envelope();
        env.source_uuid = None;
        env.source_device = None;
        assert!(env.is_sealed_sender());

        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("source_uuid"));
        assert!(!json.contains("source_device"));
    }

    #[test]
    fn destination_address() {
        let env = envelope();
        let addr = env.destination();
        assert_eq!(addr.account, env.destination_uuid);
        assert_eq!(addr.device_id, 2);
        assert_eq!(format!("{}", addr), format!("{}::2", env.destination_uuid));
    }
}
