//! In-memory room membership and message routing for connected clients.

use dashmap::DashMap;
use parley_core::{RoomId, UserId};
use rand::RngExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::ServerMessage;

/// Inclusive lower bound for allocated room ids.
const ROOM_ID_MIN: u32 = 1_000;
/// Exclusive upper bound for allocated room ids.
const ROOM_ID_MAX: u32 = 100_000;

/// Message sender for a client connection
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A connected client within a room.
#[derive(Debug, Clone)]
pub struct Member {
    pub user_id: UserId,
    pub name: String,
    pub sender: MessageSender,
}

/// Hub for room membership and per-client message delivery.
///
/// All mutations of room state go through this type; connection handlers
/// never touch the maps directly.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<RoomId, Vec<Member>>>,
    next_user_id: Arc<AtomicU64>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            next_user_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Assign the next user id. Ids are unique for the lifetime of the
    /// process and never reused.
    #[must_use]
    pub fn next_user_id(&self) -> UserId {
        UserId::new(self.next_user_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Draw a room id not currently in use, resampling on collision.
    #[must_use]
    pub fn allocate_room_id(&self) -> RoomId {
        let mut rng = rand::rng();
        loop {
            let candidate = RoomId::new(rng.random_range(ROOM_ID_MIN..ROOM_ID_MAX));
            if !self.rooms.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Register a member, creating the room if this is its first one.
    pub fn join(&self, room_id: RoomId, member: Member) {
        info!(
            room_id = %room_id,
            user_id = %member.user_id,
            name = %member.name,
            "member joined room"
        );
        self.rooms.entry(room_id).or_default().push(member);
    }

    /// Remove a member; drops the room once it is empty. Returns whether
    /// the member was present.
    pub fn leave(&self, room_id: RoomId, user_id: UserId) -> bool {
        let Some(mut members) = self.rooms.get_mut(&room_id) else {
            warn!(room_id = %room_id, user_id = %user_id, "leave for unknown room");
            return false;
        };
        let before = members.len();
        members.retain(|m| m.user_id != user_id);
        let removed = members.len() < before;
        drop(members); // Drop the RefMut before removing

        // A join can land between the retain above and this removal, so
        // only an entry that is still empty may go.
        if self
            .rooms
            .remove_if(&room_id, |_, members| members.is_empty())
            .is_some()
        {
            debug!(room_id = %room_id, "room has no more members, removed");
        }

        if removed {
            info!(room_id = %room_id, user_id = %user_id, "member left room");
        } else {
            warn!(room_id = %room_id, user_id = %user_id, "leave for unknown member");
        }
        removed
    }

    /// Deliver a message to one member. Returns the number of deliveries
    /// (0 when the room or member is unknown).
    pub fn send_to_user(&self, room_id: RoomId, user_id: UserId, message: ServerMessage) -> usize {
        let mut sent = 0;
        let mut failed = Vec::new();

        if let Some(members) = self.rooms.get(&room_id) {
            for member in members.iter().filter(|m| m.user_id == user_id) {
                if member.sender.send(message.clone()).is_ok() {
                    sent += 1;
                } else {
                    failed.push(member.user_id);
                }
            }
        }

        self.cleanup_failed(room_id, failed);
        sent
    }

    /// Deliver a message to every member of a room except one (the
    /// originator). Returns the number of deliveries.
    pub fn broadcast_except(
        &self,
        room_id: RoomId,
        except: UserId,
        message: ServerMessage,
    ) -> usize {
        let mut sent = 0;
        let mut failed = Vec::new();

        if let Some(members) = self.rooms.get(&room_id) {
            for member in members.iter().filter(|m| m.user_id != except) {
                if member.sender.send(message.clone()).is_ok() {
                    sent += 1;
                    debug!(
                        room_id = %room_id,
                        user_id = %member.user_id,
                        message_type = message.message_type(),
                        "message sent to member"
                    );
                } else {
                    warn!(
                        room_id = %room_id,
                        user_id = %member.user_id,
                        "failed to send to member, marking for cleanup"
                    );
                    failed.push(member.user_id);
                }
            }
        }

        self.cleanup_failed(room_id, failed);
        sent
    }

    fn cleanup_failed(&self, room_id: RoomId, failed: Vec<UserId>) {
        for user_id in failed {
            self.leave(room_id, user_id);
        }
    }

    /// Number of members in a room.
    #[must_use]
    pub fn member_count(&self, room_id: RoomId) -> usize {
        self.rooms.get(&room_id).map_or(0, |members| members.len())
    }

    /// Number of active rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
