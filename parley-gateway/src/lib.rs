//! Signaling gateway: owns client WebSocket connections, room and user
//! identity, presence broadcasts, and routes relay answers back to the
//! connection that sent the matching offer.

pub mod protocol;
pub mod registry;
pub mod ws;

use axum::{routing::get, Router};
use parley_bus::{BusReceiver, BusSender, RelayToGateway};
use parley_core::Config;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, warn};

use protocol::ServerMessage;
use registry::RoomRegistry;

/// Pause before retrying after a bus receive error, so a broken bus does
/// not spin the loop.
const BUS_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Shared state for the HTTP layer.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<RoomRegistry>,
    pub offers: Arc<dyn BusSender>,
    pub config: Arc<Config>,
}

/// Build the gateway router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws::websocket_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Consume the relay→gateway topic and deliver answers to the matching
/// connections. Unroutable or malformed answers are logged and dropped;
/// only a closed bus ends the loop.
pub async fn run_answer_loop<R: BusReceiver>(registry: Arc<RoomRegistry>, mut answers: R) {
    loop {
        match answers.recv().await {
            Ok(Some(message)) => match serde_json::from_str::<RelayToGateway>(&message.payload) {
                Ok(RelayToGateway::Answer {
                    room_id,
                    user_id,
                    sdp,
                }) => {
                    let delivered =
                        registry.send_to_user(room_id, user_id, ServerMessage::Answer { sdp, room_id });
                    if delivered == 0 {
                        error!(
                            room_id = %room_id,
                            user_id = %user_id,
                            "answer for unknown room or user, discarding"
                        );
                    }
                }
                Err(e) => {
                    warn!(error = %e, key = message.key, "malformed relay message, discarding");
                }
            },
            Ok(None) => {
                info!("answer topic closed, stopping answer loop");
                break;
            }
            Err(e) => {
                error!(error = %e, "bus receive failed, backing off");
                tokio::time::sleep(BUS_ERROR_BACKOFF).await;
            }
        }
    }
}
