use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{error, warn};
use uuid::Uuid;

use courier_queue::now_ms;
use courier_types::accounts::Account;
use courier_types::api::{
    DeviceClaims, IncomingMessage, IncomingMessageList, MismatchedDevices, OutgoingMessageList,
    SendMessageResponse, StaleDevices,
};
use courier_types::{DeviceAddress, Envelope, EnvelopeKind};

use crate::limits::Decision;
use crate::ApiState;

/// PUT /v1/messages/{recipient}
///
/// Validates the submitted per-device list against the recipient's current
/// device set before anything is accepted: a mismatch (409) or a stale
/// registration id (410) never results in a partial send.
pub async fn send_messages(
    State(state): State<ApiState>,
    Path(recipient): Path<Uuid>,
    Extension(claims): Extension<DeviceClaims>,
    Json(list): Json<IncomingMessageList>,
) -> Response {
    match state.limiter.check(claims.sub) {
        Decision::Allowed => {}
        Decision::RateLimited { retry_after } => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after.as_secs().to_string())],
            )
                .into_response();
        }
        Decision::Blocked => {
            // Push challenge required before further sends are accepted.
            return StatusCode::PRECONDITION_REQUIRED.into_response();
        }
    }

    let Some(account) = state.directory.get(recipient).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // A self-send syncs the sender's other devices; its own is exempt.
    let excluded_device = (recipient == claims.sub).then_some(claims.device);
    if let Some(mismatch) = validate_device_set(&account, &list.messages, excluded_device) {
        return (StatusCode::CONFLICT, Json(mismatch)).into_response();
    }
    if let Some(stale) = check_registration_ids(&account, &list.messages) {
        return (StatusCode::GONE, Json(stale)).into_response();
    }

    // Decode every payload before dispatching anything, so a malformed
    // message cannot leave a partial multi-device send behind.
    let mut outgoing = Vec::with_capacity(list.messages.len());
    for message in &list.messages {
        match build_envelope(&claims, recipient, message, list.timestamp) {
            Some(envelope) => outgoing.push((message.destination_device, envelope)),
            None => {
                warn!("rejecting undecodable payload from {}", claims.sub);
                return StatusCode::UNPROCESSABLE_ENTITY.into_response();
            }
        }
    }

    for (device_id, envelope) in outgoing {
        let Some(device) = account.device(device_id) else {
            // Validated above; the set cannot have changed within this call.
            continue;
        };
        if let Err(e) = state.sender.send(device, envelope, list.online).await {
            error!("send to {}::{} failed: {}", recipient, device_id, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    // Sealed-sender lists reveal nothing about the sender, including whether
    // a sync copy is owed.
    let needs_sync = if sealed_list(&list.messages) {
        false
    } else {
        match state.directory.get(claims.sub).await {
            Some(sender_account) => sender_account.devices.len() > 1,
            None => false,
        }
    };

    Json(SendMessageResponse { needs_sync }).into_response()
}

/// GET /v1/messages/
pub async fn get_messages(
    State(state): State<ApiState>,
    Extension(claims): Extension<DeviceClaims>,
) -> Response {
    let addr = DeviceAddress::new(claims.sub, claims.device);
    match state.manager.get_messages_for_device(&addr, false).await {
        Ok((messages, has_more)) => Json(OutgoingMessageList { messages, has_more }).into_response(),
        Err(e) => {
            error!("pending read failed for {}: {}", addr, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// DELETE /v1/messages/{guid}
pub async fn delete_message(
    State(state): State<ApiState>,
    Path(guid): Path<Uuid>,
    Extension(claims): Extension<DeviceClaims>,
) -> Response {
    let addr = DeviceAddress::new(claims.sub, claims.device);
    match state.manager.delete_by_guid(&addr, guid).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("ack failed for {} guid {}: {}", addr, guid, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// DELETE /v1/messages/{sender}/{timestamp} — legacy acknowledgement.
pub async fn delete_message_by_sender(
    State(state): State<ApiState>,
    Path((sender, timestamp)): Path<(Uuid, u64)>,
    Extension(claims): Extension<DeviceClaims>,
) -> Response {
    let addr = DeviceAddress::new(claims.sub, claims.device);
    match state
        .manager
        .delete_by_sender_timestamp(&addr, sender, timestamp)
        .await
    {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("legacy ack failed for {}: {}", addr, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn sealed_list(messages: &[IncomingMessage]) -> bool {
    messages
        .iter()
        .all(|m| m.kind == EnvelopeKind::UnidentifiedSender)
}

fn build_envelope(
    claims: &DeviceClaims,
    recipient: Uuid,
    message: &IncomingMessage,
    client_timestamp: u64,
) -> Option<Envelope> {
    let content = match &message.content {
        Some(encoded) => Some(STANDARD.decode(encoded).ok()?),
        None => None,
    };
    let sealed = message.kind == EnvelopeKind::UnidentifiedSender;

    Some(Envelope {
        guid: Uuid::new_v4(),
        kind: message.kind,
        client_timestamp,
        server_timestamp: now_ms(),
        source_uuid: (!sealed).then_some(claims.sub),
        source_device: (!sealed).then_some(claims.device),
        destination_uuid: recipient,
        destination_device: message.destination_device,
        content,
    })
}

/// The submitted list must address exactly the recipient's device set
/// (minus the sender's own device on a self-send).
fn validate_device_set(
    account: &Account,
    messages: &[IncomingMessage],
    excluded_device: Option<u8>,
) -> Option<MismatchedDevices> {
    let required: Vec<u8> = account
        .device_ids()
        .into_iter()
        .filter(|id| Some(*id) != excluded_device)
        .collect();
    let submitted: Vec<u8> = messages.iter().map(|m| m.destination_device).collect();

    let mut missing: Vec<u8> = required
        .iter()
        .filter(|id| !submitted.contains(id))
        .copied()
        .collect();
    let mut extra: Vec<u8> = submitted
        .iter()
        .filter(|id| !required.contains(id))
        .copied()
        .collect();
    missing.sort_unstable();
    extra.sort_unstable();
    extra.dedup();

    if missing.is_empty() && extra.is_empty() {
        None
    } else {
        Some(MismatchedDevices {
            missing_devices: missing,
            extra_devices: extra,
        })
    }
}

/// Registration ids prove the sender's sessions are current; any mismatch
/// means its device state is stale and the whole send is refused.
fn check_registration_ids(account: &Account, messages: &[IncomingMessage]) -> Option<StaleDevices> {
    let mut stale: Vec<u8> = messages
        .iter()
        .filter_map(|m| {
            let device = account.device(m.destination_device)?;
            (device.registration_id != m.destination_registration_id).then_some(device.id)
        })
        .collect();
    stale.sort_unstable();

    if stale.is_empty() {
        None
    } else {
        Some(StaleDevices {
            stale_devices: stale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::accounts::Device;

    fn device(id: u8, registration_id: u32) -> Device {
        Device {
            id,
            registration_id,
            apn_token: None,
            fcm_token: None,
            fetches_messages: false,
        }
    }

    fn account(devices: Vec<Device>) -> Account {
        Account {
            uuid: Uuid::new_v4(),
            devices,
        }
    }

    fn incoming(destination_device: u8, registration_id: u32) -> IncomingMessage {
        IncomingMessage {
            kind: EnvelopeKind::Ciphertext,
            destination_device,
            destination_registration_id: registration_id,
            content: Some(STANDARD.encode(b"payload")),
        }
    }

    #[test]
    fn missing_device_is_reported() {
        let account = account(vec![device(1, 10), device(2, 20), device(3, 30)]);
        let messages = vec![incoming(1, 10), incoming(2, 20)];

        let mismatch = validate_device_set(&account, &messages, None).unwrap();
        assert_eq!(mismatch.missing_devices, vec![3]);
        assert!(mismatch.extra_devices.is_empty());
    }

    #[test]
    fn extra_device_is_reported() {
        let account = account(vec![device(1, 10)]);
        let messages = vec![incoming(1, 10), incoming(9, 0)];

        let mismatch = validate_device_set(&account, &messages, None).unwrap();
        assert!(mismatch.missing_devices.is_empty());
        assert_eq!(mismatch.extra_devices, vec![9]);
    }

    #[test]
    fn complete_set_passes() {
        let account = account(vec![device(1, 10), device(2, 20)]);
        let messages = vec![incoming(1, 10), incoming(2, 20)];
        assert!(validate_device_set(&account, &messages, None).is_none());
    }

    #[test]
    fn self_send_excludes_own_device() {
        let account = account(vec![device(1, 10), device(2, 20)]);
        // Device 1 sending to itself only needs to cover device 2.
        let messages = vec![incoming(2, 20)];
        assert!(validate_device_set(&account, &messages, Some(1)).is_none());
    }

    #[test]
    fn stale_registration_id_is_reported() {
        let account = account(vec![device(1, 10), device(2, 20)]);
        let messages = vec![incoming(1, 10), incoming(2, 99)];

        let stale = check_registration_ids(&account, &messages).unwrap();
        assert_eq!(stale.stale_devices, vec![2]);
    }

    #[test]
    fn sealed_send_strips_source() {
        let claims = DeviceClaims {
            sub: Uuid::new_v4(),
            device: 1,
            exp: 0,
        };
        let mut message = incoming(2, 20);
        message.kind = EnvelopeKind::UnidentifiedSender;

        let envelope = build_envelope(&claims, Uuid::new_v4(), &message, 123).unwrap();
        assert!(envelope.source_uuid.is_none());
        assert!(envelope.source_device.is_none());
        assert!(envelope.is_sealed_sender());

        message.kind = EnvelopeKind::Ciphertext;
        let envelope = build_envelope(&claims, Uuid::new_v4(), &message, 123).unwrap();
        assert_eq!(envelope.source_uuid, Some(claims.sub));
        assert_eq!(envelope.source_device, Some(1));
    }

    #[test]
    fn bad_base64_is_rejected() {
        let claims = DeviceClaims {
            sub: Uuid::new_v4(),
            device: 1,
            exp: 0,
        };
        let mut message = incoming(2, 20);
        message.content = Some("!!not-base64!!".into());
        assert!(build_envelope(&claims, Uuid::new_v4(), &message, 123).is_none());
    }
}
