//! Client-facing WebSocket protocol: the join handshake and the messages
//! the gateway pushes to connected clients.

use parley_core::{RoomId, UserId};
use serde::{Deserialize, Serialize};

/// First frame a client sends after opening the socket.
///
/// `room_id` is accepted as a JSON number or a numeric string; anything
/// else (including absence) means "allocate a fresh room".
#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    #[serde(default)]
    pub room_id: Option<serde_json::Value>,
    pub sdp: String,
}

impl JoinRequest {
    /// Parse and validate the handshake frame. Returns `None` for
    /// malformed JSON or an empty name/sdp; the caller drops the
    /// connection without a response.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let request: Self = serde_json::from_str(raw).ok()?;
        if request.name.trim().is_empty() || request.sdp.trim().is_empty() {
            return None;
        }
        Some(request)
    }

    /// The room the client asked for, when it supplied something usable
    /// as a room id.
    #[must_use]
    pub fn requested_room(&self) -> Option<RoomId> {
        match &self.room_id {
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map(RoomId::new),
            Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Messages pushed to clients over the WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// The relay's SDP answer for this client's offer. Carries the room
    /// id so the client learns which room it landed in.
    Answer { sdp: String, room_id: RoomId },
    /// Another participant joined the room.
    PeerJoined { user_id: UserId, name: String },
    /// A participant left the room.
    PeerLeft { user_id: UserId },
}

impl ServerMessage {
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Answer { .. } => "answer",
            Self::PeerJoined { .. } => "peer-joined",
            Self::PeerLeft { .. } => "peer-left",
        }
    }
}
