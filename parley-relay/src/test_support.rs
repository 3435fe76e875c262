//! Recording transport doubles for worker and dispatcher tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::{Result, UserId};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::transport::{
    SessionEvent, SessionState, SessionTransport, TransportEvent, TransportFactory,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MockAudio {
    pub owner: UserId,
}

pub(crate) struct MockTransport {
    pub user_id: UserId,
    pub events: mpsc::Sender<SessionEvent<MockAudio>>,
    /// Senders whose audio was forwarded into this transport, in order.
    pub forwards: Mutex<Vec<UserId>>,
    pub closed: AtomicBool,
}

#[async_trait]
impl SessionTransport for MockTransport {
    type Audio = MockAudio;

    async fn apply_offer(&self, sdp: &str) -> Result<String> {
        Ok(format!("answer:{sdp}"))
    }

    async fn forward(&self, from: UserId, _source: &MockAudio) -> Result<()> {
        self.forwards.lock().push(from);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct MockFactory {
    transports: Mutex<HashMap<UserId, Arc<MockTransport>>>,
    pub open_count: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl TransportFactory for MockFactory {
    type Transport = MockTransport;

    async fn open(
        &self,
        user_id: UserId,
        events: mpsc::Sender<SessionEvent<MockAudio>>,
    ) -> Result<Arc<MockTransport>> {
        let transport = Arc::new(MockTransport {
            user_id,
            events,
            forwards: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.transports.lock().insert(user_id, Arc::clone(&transport));
        self.open_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(transport)
    }
}

impl MockFactory {
    pub fn transport(&self, user_id: UserId) -> Option<Arc<MockTransport>> {
        self.transports.lock().get(&user_id).cloned()
    }

    /// Report the given user's audio feed to its worker.
    pub async fn emit_audio(&self, user_id: UserId) {
        let transport = self.transport(user_id).expect("unknown transport");
        transport
            .events
            .send(SessionEvent {
                user_id,
                event: TransportEvent::AudioArrived(MockAudio { owner: user_id }),
            })
            .await
            .expect("worker event channel closed");
    }

    /// Report a state transition for the given user's session.
    pub async fn emit_state(&self, user_id: UserId, state: SessionState) {
        let transport = self.transport(user_id).expect("unknown transport");
        transport
            .events
            .send(SessionEvent {
                user_id,
                event: TransportEvent::StateChanged(state),
            })
            .await
            .expect("worker event channel closed");
    }
}
