//! WebSocket connection handling: the join handshake, outbound message
//! pump, keepalive pings and cleanup on disconnect.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use parley_bus::GatewayToRelay;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::protocol::{JoinRequest, ServerMessage};
use crate::registry::Member;
use crate::GatewayState;

/// WebSocket endpoint for voice-chat clients.
pub async fn websocket_handler(
    State(state): State<GatewayState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.config.gateway.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let idle_timeout = Duration::from_secs(state.config.gateway.idle_timeout_seconds);
    let (mut sink, mut stream) = socket.split();

    // The first frame must be the join request. Anything else (timeout,
    // non-text frame, malformed JSON, missing fields) drops the
    // connection with no response.
    let first = match timeout(idle_timeout, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(_))) => {
            debug!("non-text handshake frame, dropping connection");
            return;
        }
        Ok(Some(Err(e))) => {
            debug!(error = %e, "socket error before handshake");
            return;
        }
        Ok(None) => return,
        Err(_) => {
            debug!("handshake timed out, dropping connection");
            return;
        }
    };

    let Some(join) = JoinRequest::parse(&first) else {
        warn!("malformed join request, dropping connection");
        return;
    };

    let room_id = join
        .requested_room()
        .unwrap_or_else(|| state.registry.allocate_room_id());
    let user_id = state.registry.next_user_id();
    let name = join.name.clone();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.registry.join(
        room_id,
        Member {
            user_id,
            name: name.clone(),
            sender: tx,
        },
    );

    // Hand the offer to the relay tier, keyed by user id.
    let offer = GatewayToRelay::Offer {
        room_id,
        user_id,
        sdp: join.sdp,
    };
    match serde_json::to_string(&offer) {
        Ok(payload) => {
            if let Err(e) = state.offers.send(user_id.value(), payload).await {
                error!(
                    room_id = %room_id,
                    user_id = %user_id,
                    error = %e,
                    "failed to publish offer"
                );
            }
        }
        Err(e) => {
            error!(room_id = %room_id, user_id = %user_id, error = %e, "failed to encode offer");
        }
    }

    state.registry.broadcast_except(
        room_id,
        user_id,
        ServerMessage::PeerJoined {
            user_id,
            name: name.clone(),
        },
    );

    let keepalive = Duration::from_secs(state.config.gateway.keepalive_seconds);
    let mut ping = tokio::time::interval(keepalive);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else { break };
                let text = match serde_json::to_string(&message) {
                    Ok(t) => t,
                    Err(e) => {
                        error!(user_id = %user_id, error = %e, "failed to encode server message");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Any frame, pongs included, counts as liveness.
                        last_inbound = Instant::now();
                    }
                    Some(Err(e)) => {
                        debug!(user_id = %user_id, error = %e, "socket error");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if last_inbound.elapsed() >= idle_timeout {
                    info!(room_id = %room_id, user_id = %user_id, "connection idle, dropping");
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.registry.leave(room_id, user_id);
    state
        .registry
        .broadcast_except(room_id, user_id, ServerMessage::PeerLeft { user_id });
    info!(room_id = %room_id, user_id = %user_id, name = %name, "connection closed");
}
