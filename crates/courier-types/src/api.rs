use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{Envelope, EnvelopeKind};

// -- Sending --

/// One per-device message inside a `PUT /v1/messages/{recipient}` body.
/// `content` is base64; it is decoded once at the HTTP boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub destination_device: u8,
    /// Registration id the sender believes the destination device has.
    /// A mismatch means the sender's session state is stale.
    pub destination_registration_id: u32,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessageList {
    pub messages: Vec<IncomingMessage>,
    pub timestamp: u64,
    /// True when the request arrived over a session that should not be
    /// treated as a live delivery attempt (client is backgrounded).
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    /// True when the sender has other registered devices that expect a
    /// sync copy of this message.
    pub needs_sync: bool,
}

// -- Device-set validation failures --

/// 409 body: the submitted message list does not cover the recipient's
/// current device set.
#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchedDevices {
    pub missing_devices: Vec<u8>,
    pub extra_devices: Vec<u8>,
}

/// 410 body: one or more devices were addressed with an outdated
/// registration id.
#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleDevices {
    pub stale_devices: Vec<u8>,
}

// -- Receiving --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessageList {
    pub messages: Vec<Envelope>,
    /// Hint that the queue holds more than one page.
    pub has_more: bool,
}

// -- Auth --

/// JWT claims carried by every authenticated request and socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceClaims {
    /// Account UUID.
    pub sub: Uuid,
    /// Device id within the account.
    pub device: u8,
    pub exp: usize,
}
