//! Per-participant state held by a room worker.

use parley_core::UserId;
use std::sync::Arc;

use crate::transport::SessionTransport;

/// One participant inside a room: the transport plus the audio feed once
/// it has started flowing.
pub struct ParticipantSession<T: SessionTransport> {
    pub user_id: UserId,
    pub transport: Arc<T>,
    pub audio: Option<T::Audio>,
}

impl<T: SessionTransport> ParticipantSession<T> {
    pub fn new(user_id: UserId, transport: Arc<T>) -> Self {
        Self {
            user_id,
            transport,
            audio: None,
        }
    }

    #[must_use]
    pub const fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}
