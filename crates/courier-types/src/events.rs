use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::Envelope;

/// Frames pushed from server to client over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayFrame {
    /// Server confirms successful authentication.
    Ready { account: Uuid, device_id: u8 },

    /// A pending or freshly sent envelope. The client must acknowledge
    /// each one with `ClientFrame::Ack` before it is removed server-side.
    Message { envelope: Envelope },

    /// An online-only envelope. Never stored; no acknowledgement expected.
    EphemeralMessage { envelope: Envelope },

    /// The pending queue has been fully delivered.
    QueueDrained,
}

/// Frames sent from client to server over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    /// Authenticate the WebSocket connection.
    Identify { token: String },

    /// Acknowledge receipt of one envelope by GUID.
    Ack { guid: Uuid },

    /// Acknowledge receipt of one envelope by sender and client timestamp.
    /// Older clients that predate GUID acknowledgement still send this.
    AckBySender { sender: Uuid, timestamp: u64 },
}

/// Events observed on a device queue. Session loops select on a channel of
/// these alongside the socket itself.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// New durable messages were inserted; the session should flush.
    NewMessages,
    /// An online-only envelope arrived via the wake channel.
    NewEphemeral(Box<Envelope>),
    /// The persister moved aged messages into durable storage; a flush will
    /// now read them from the table instead of the cache.
    MessagesPersisted,
}

/// Close code sent when a newer session takes over the (account, device)
/// binding. Mirrors the HTTP 409 semantics on the socket.
pub const CLOSE_CODE_REPLACED: u16 = 4409;

/// Close code for unrecoverable internal errors; clients should reconnect.
pub const CLOSE_CODE_INTERNAL_ERROR: u16 = 4500;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_tagging() {
        let json = r#"{"type":"Ack","data":{"guid":"936DA01F-9ABD-4D9D-80C7-02AF85C822A8"}}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Ack { guid } => {
                assert_eq!(guid, "936DA01F-9ABD-4D9D-80C7-02AF85C822A8".parse::<Uuid>().unwrap())
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn gateway_frame_roundtrip() {
        let frame = GatewayFrame::QueueDrained;
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("QueueDrained"));
    }
}
