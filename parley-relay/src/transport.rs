//! Session-transport seam between room workers and the real-time stack.
//!
//! A transport turns a remote SDP offer into a local answer and reports
//! back through a message channel rather than callbacks, so a worker's
//! state is only ever touched from its own loop.

use async_trait::async_trait;
use parley_core::{Result, UserId};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle of one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    /// Terminal states trigger participant removal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Notification from a transport to its room worker.
#[derive(Debug)]
pub enum TransportEvent<A> {
    StateChanged(SessionState),
    /// The participant's audio started flowing; the payload is a handle
    /// other transports can forward from.
    AudioArrived(A),
}

/// A transport event tagged with the session it belongs to.
#[derive(Debug)]
pub struct SessionEvent<A> {
    pub user_id: UserId,
    pub event: TransportEvent<A>,
}

/// One participant's real-time session.
#[async_trait]
pub trait SessionTransport: Send + Sync + 'static {
    /// Handle to this session's inbound audio, cheap to clone and safe
    /// to forward into other sessions.
    type Audio: Clone + Send + Sync + 'static;

    /// Apply the remote offer and produce the local answer SDP.
    async fn apply_offer(&self, sdp: &str) -> Result<String>;

    /// Route another participant's audio into this session.
    async fn forward(&self, from: UserId, source: &Self::Audio) -> Result<()>;

    /// Tear the session down. Idempotent; also detaches any fan-out
    /// attached via `forward`.
    async fn close(&self);
}

/// Creates transports wired to a worker's event channel.
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: SessionTransport;

    async fn open(
        &self,
        user_id: UserId,
        events: mpsc::Sender<SessionEvent<<Self::Transport as SessionTransport>::Audio>>,
    ) -> Result<Arc<Self::Transport>>;
}

/// Audio handle type produced by a factory's transports.
pub type AudioOf<F> = <<F as TransportFactory>::Transport as SessionTransport>::Audio;
