use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{decode, DecodingKey, Validation};
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_queue::now_ms;
use courier_types::api::DeviceClaims;
use courier_types::events::{
    ClientFrame, GatewayFrame, QueueEvent, CLOSE_CODE_INTERNAL_ERROR, CLOSE_CODE_REPLACED,
};
use courier_types::DeviceAddress;

use crate::dispatcher::SessionSignal;
use crate::session::{SessionInput, SessionState};
use crate::GatewayContext;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A frame unacknowledged for this long is considered lost; the queue is
/// re-flushed. Delivery is at-least-once, so a duplicate beats a gap.
const ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle a single WebSocket session through its whole lifecycle:
/// authenticate, register presence, flush the pending queue, then follow
/// wake events until the socket closes or a newer session displaces it.
pub async fn handle_connection(socket: WebSocket, ctx: GatewayContext) {
    let (mut sender, mut receiver) = socket.split();

    let claims = match wait_for_identify(&mut receiver, &ctx.jwt_secret).await {
        Some(claims) => claims,
        None => {
            warn!("websocket client failed to identify, closing");
            return;
        }
    };
    let addr = DeviceAddress::new(claims.sub, claims.device);

    info!("{} connected to gateway", addr);
    ctx.metrics.sessions_connected.fetch_add(1, Ordering::Relaxed);

    let ready = GatewayFrame::Ready {
        account: addr.account,
        device_id: addr.device_id,
    };
    if send_frame(&mut sender, &ready).await.is_err() {
        return;
    }

    // Order matters: register locally (displacing any predecessor), claim
    // the shared presence record, then attach the availability listener so
    // no wake event published after set_present is missed.
    let (conn_id, mut signals) = ctx.dispatcher.register(addr);
    if let Err(e) = ctx.presence.set_present(&addr).await {
        warn!("failed to register presence for {}: {}", addr, e);
    }
    let mut queue_events = ctx.manager.add_message_availability_listener(addr);

    // The device is reachable again; pending push retries are moot.
    if let Err(e) = ctx.push.cancel(&addr).await {
        debug!("failed to cancel push schedule for {}: {}", addr, e);
    }
    if let Some(activated_at) = ctx.metrics.take_queue_activation(&addr) {
        debug!(
            "{} woke {} ms after queue activation",
            addr,
            now_ms().saturating_sub(activated_at)
        );
    }

    let mut state = SessionState::Connected;
    let mut outstanding: HashMap<Uuid, Instant> = HashMap::new();
    let mut has_more = false;

    state = flush(&mut sender, &ctx, &addr, &mut outstanding, &mut has_more, state).await;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    // Skip the immediate first tick
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;
    let mut pong_received = true;

    while !state.is_terminal() {
        tokio::select! {
            frame = receiver.next() => {
                let Some(Ok(message)) = frame else { break };
                match message {
                    Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(ClientFrame::Ack { guid }) => {
                            outstanding.remove(&guid);
                            match ctx.manager.delete_by_guid(&addr, guid).await {
                                Ok(Some(_)) => {}
                                Ok(None) => debug!("{} acked unknown guid {}", addr, guid),
                                Err(e) => {
                                    warn!("ack failed for {} guid {}: {}", addr, guid, e);
                                    close_for_internal_error(&mut sender).await;
                                    state = state.advance(SessionInput::Disconnect);
                                    continue;
                                }
                            }
                            state = after_ack(&mut sender, &ctx, &addr, &mut outstanding, &mut has_more, state).await;
                        }
                        Ok(ClientFrame::AckBySender { sender: source, timestamp }) => {
                            match ctx.manager.delete_by_sender_timestamp(&addr, source, timestamp).await {
                                Ok(Some(removed)) => {
                                    outstanding.remove(&removed.guid);
                                }
                                Ok(None) => debug!("{} acked unknown (sender, timestamp)", addr),
                                Err(e) => {
                                    warn!("ack by sender failed for {}: {}", addr, e);
                                    close_for_internal_error(&mut sender).await;
                                    state = state.advance(SessionInput::Disconnect);
                                    continue;
                                }
                            }
                            state = after_ack(&mut sender, &ctx, &addr, &mut outstanding, &mut has_more, state).await;
                        }
                        Ok(ClientFrame::Identify { .. }) => {} // Already handled
                        Err(e) => {
                            warn!(
                                "{} bad frame: {} -- raw: {}",
                                addr,
                                e,
                                &text[..text.len().min(200)]
                            );
                        }
                    },
                    Message::Pong(_) => {
                        pong_received = true;
                    }
                    Message::Close(_) => {
                        state = state.advance(SessionInput::Disconnect);
                    }
                    _ => {}
                }
            }

            signal = signals.recv() => {
                match signal {
                    Some(SessionSignal::Deliver(envelope)) => {
                        // Live in-process delivery; tracked like any flushed
                        // frame so a lost socket re-queues nothing extra.
                        let guid = envelope.guid;
                        if send_frame(&mut sender, &GatewayFrame::Message { envelope: *envelope }).await.is_err() {
                            break;
                        }
                        outstanding.insert(guid, Instant::now());
                    }
                    Some(SessionSignal::Displaced) => {
                        info!("{} displaced by a newer session", addr);
                        let close = CloseFrame {
                            code: CLOSE_CODE_REPLACED,
                            reason: "replaced by new connection".into(),
                        };
                        let _ = sender.send(Message::Close(Some(close))).await;
                        state = state.advance(SessionInput::Disconnect);
                    }
                    None => break,
                }
            }

            event = queue_events.recv() => {
                match event {
                    Some(QueueEvent::NewMessages) => {
                        state = flush(&mut sender, &ctx, &addr, &mut outstanding, &mut has_more, state).await;
                    }
                    Some(QueueEvent::NewEphemeral(envelope)) => {
                        // Online-only: deliver without storage or ack tracking.
                        if send_frame(&mut sender, &GatewayFrame::EphemeralMessage { envelope: *envelope }).await.is_err() {
                            break;
                        }
                    }
                    Some(QueueEvent::MessagesPersisted) => {
                        // Aged messages moved to the durable table; the next
                        // merged read picks them up from there.
                        debug!("{} queue page persisted", addr);
                    }
                    None => break,
                }
            }

            _ = heartbeat.tick() => {
                if pong_received {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("heartbeat timeout for {} (missed {} pongs)", addr, missed_heartbeats);
                        break;
                    }
                }
                pong_received = false;
                if sender.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }

                // Re-flush frames whose ack never arrived; they are still in
                // the queue, so this is a resend, not a duplicate insert.
                let stale = outstanding
                    .values()
                    .any(|sent_at| sent_at.elapsed() >= ACK_TIMEOUT);
                if stale {
                    debug!("{} ack timeout, re-flushing", addr);
                    outstanding.clear();
                    state = flush(&mut sender, &ctx, &addr, &mut outstanding, &mut has_more, state).await;
                }
            }
        }
    }

    // A displaced session must leave its successor's registrations alone.
    let was_current = ctx.dispatcher.unregister(&addr, conn_id);
    if was_current {
        ctx.manager.remove_message_availability_listener(&addr);
        if let Err(e) = ctx.presence.clear_presence(&addr).await {
            warn!("failed to clear presence for {}: {}", addr, e);
        }
        if let Err(e) = ctx.push.cancel(&addr).await {
            debug!("failed to cancel push schedule for {}: {}", addr, e);
        }
    }
    info!("{} disconnected from gateway", addr);
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<DeviceClaims> {
    // Give the client 10 seconds to identify
    let timeout = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(ClientFrame::Identify { token }) =
                    serde_json::from_str::<ClientFrame>(&text)
                {
                    let token_data = decode::<DeviceClaims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some(token_data.claims);
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &GatewayFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).expect("frame serialization is infallible");
    sender.send(Message::Text(text.into())).await
}

/// A storage or cache failure inside the session is not recoverable here;
/// close with the reconnect code so the client re-attaches and re-flushes.
async fn close_for_internal_error(sender: &mut SplitSink<WebSocket, Message>) {
    let close = CloseFrame {
        code: CLOSE_CODE_INTERNAL_ERROR,
        reason: "internal error".into(),
    };
    let _ = sender.send(Message::Close(Some(close))).await;
}

/// After an acknowledgement: continue paging when more is pending, or settle
/// into idle once everything sent has been confirmed.
async fn after_ack(
    sender: &mut SplitSink<WebSocket, Message>,
    ctx: &GatewayContext,
    addr: &DeviceAddress,
    outstanding: &mut HashMap<Uuid, Instant>,
    has_more: &mut bool,
    state: SessionState,
) -> SessionState {
    if !outstanding.is_empty() {
        return state;
    }
    if *has_more {
        return flush(sender, ctx, addr, outstanding, has_more, state).await;
    }

    // Queue fully confirmed: nothing left to wake this device for.
    if let Err(e) = ctx.push.cancel(addr).await {
        debug!("failed to cancel push schedule for {}: {}", addr, e);
    }
    if send_frame(sender, &GatewayFrame::QueueDrained).await.is_err() {
        return state.advance(SessionInput::Disconnect);
    }
    state.advance(SessionInput::FlushDrained)
}

/// Writes every pending envelope not already in flight, oldest first.
async fn flush(
    sender: &mut SplitSink<WebSocket, Message>,
    ctx: &GatewayContext,
    addr: &DeviceAddress,
    outstanding: &mut HashMap<Uuid, Instant>,
    has_more: &mut bool,
    state: SessionState,
) -> SessionState {
    let state = state.advance(SessionInput::FlushStarted);

    let (messages, more) = match ctx.manager.get_messages_for_device(addr, false).await {
        Ok(page) => page,
        Err(e) => {
            warn!("flush read failed for {}: {}", addr, e);
            close_for_internal_error(sender).await;
            return state.advance(SessionInput::Disconnect);
        }
    };
    *has_more = more;

    if messages.is_empty() && outstanding.is_empty() {
        if send_frame(sender, &GatewayFrame::QueueDrained).await.is_err() {
            return state.advance(SessionInput::Disconnect);
        }
        return state.advance(SessionInput::FlushDrained);
    }

    for envelope in messages {
        if outstanding.contains_key(&envelope.guid) {
            continue;
        }
        let guid = envelope.guid;
        if send_frame(sender, &GatewayFrame::Message { envelope }).await.is_err() {
            return state.advance(SessionInput::Disconnect);
        }
        outstanding.insert(guid, Instant::now());
    }
    state
}
