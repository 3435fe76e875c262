//! Wire messages exchanged between the gateway and the relay tier.

use parley_core::{RoomId, UserId};
use serde::{Deserialize, Serialize};

/// Messages the gateway publishes for the relay dispatcher.
///
/// `killroom` and `kickuser` are reserved names in the protocol; the
/// dispatcher acknowledges them in logs but does not act on them yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayToRelay {
    Offer {
        room_id: RoomId,
        user_id: UserId,
        sdp: String,
    },
    #[serde(rename = "killroom")]
    KillRoom { room_id: RoomId },
    #[serde(rename = "kickuser")]
    KickUser { room_id: RoomId, user_id: UserId },
}

impl GatewayToRelay {
    /// Wire name of the message, matching the `type` tag.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::KillRoom { .. } => "killroom",
            Self::KickUser { .. } => "kickuser",
        }
    }

    #[must_use]
    pub const fn room_id(&self) -> RoomId {
        match self {
            Self::Offer { room_id, .. }
            | Self::KillRoom { room_id }
            | Self::KickUser { room_id, .. } => *room_id,
        }
    }
}

/// Messages the relay tier publishes back to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayToGateway {
    Answer {
        room_id: RoomId,
        user_id: UserId,
        sdp: String,
    },
}

impl RelayToGateway {
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Answer { .. } => "answer",
        }
    }

    #[must_use]
    pub const fn room_id(&self) -> RoomId {
        match self {
            Self::Answer { room_id, .. } => *room_id,
        }
    }
}
