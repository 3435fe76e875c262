//! Room relay worker: one task per active room, owning every peer
//! session in that room and the audio fan-out between them.

use parley_bus::{BusSender, RelayToGateway};
use parley_core::{RoomId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::session::ParticipantSession;
use crate::transport::{AudioOf, SessionEvent, SessionTransport, TransportEvent, TransportFactory};

/// Capacity of the session-event channel feeding the worker loop.
const SESSION_EVENT_CAPACITY: usize = 256;

/// Upper bound on how often the idle check runs.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Commands routed to a worker by the dispatcher.
#[derive(Debug)]
pub enum RelayCommand {
    Offer { user_id: UserId, sdp: String },
    Shutdown,
}

/// Single-loop owner of one room's sessions.
///
/// All state mutation happens inside `run`: commands arrive on one
/// channel, transport notifications on another, and an idle ticker ends
/// the worker once the room has been empty long enough.
pub struct RoomWorker<F: TransportFactory> {
    room_id: RoomId,
    factory: Arc<F>,
    answers: Arc<dyn BusSender>,
    sessions: HashMap<UserId, ParticipantSession<F::Transport>>,
    commands: mpsc::Receiver<RelayCommand>,
    events_tx: mpsc::Sender<SessionEvent<AudioOf<F>>>,
    events_rx: mpsc::Receiver<SessionEvent<AudioOf<F>>>,
    idle_since: Option<Instant>,
    idle_timeout: Duration,
}

impl<F: TransportFactory> RoomWorker<F> {
    pub fn new(
        room_id: RoomId,
        factory: Arc<F>,
        answers: Arc<dyn BusSender>,
        commands: mpsc::Receiver<RelayCommand>,
        idle_timeout: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        Self {
            room_id,
            factory,
            answers,
            sessions: HashMap::new(),
            commands,
            events_tx,
            events_rx,
            // A worker that never lands a session still times out.
            idle_since: Some(Instant::now()),
            idle_timeout,
        }
    }

    pub async fn run(mut self) {
        info!(room_id = %self.room_id, "room worker started");

        let period = IDLE_CHECK_INTERVAL
            .min(self.idle_timeout)
            .max(Duration::from_millis(100));
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(RelayCommand::Offer { user_id, sdp }) => {
                        self.handle_offer(user_id, sdp).await;
                    }
                    Some(RelayCommand::Shutdown) | None => break,
                },
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }
                _ = ticker.tick() => {
                    if self
                        .idle_since
                        .is_some_and(|since| since.elapsed() >= self.idle_timeout)
                    {
                        // An offer can already sit in the command channel
                        // when the idle deadline is reached; it was
                        // accepted by the dispatcher and must be served.
                        if self.drain_commands().await {
                            continue;
                        }
                        info!(room_id = %self.room_id, "room idle, shutting down worker");
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Serve every command already buffered in the channel. Returns
    /// whether an offer was handled, meaning the idle verdict is stale.
    async fn drain_commands(&mut self) -> bool {
        let mut served = false;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                RelayCommand::Offer { user_id, sdp } => {
                    self.handle_offer(user_id, sdp).await;
                    served = true;
                }
                RelayCommand::Shutdown => return false,
            }
        }
        served
    }

    async fn handle_offer(&mut self, user_id: UserId, sdp: String) {
        if self.sessions.contains_key(&user_id) {
            warn!(
                room_id = %self.room_id,
                user_id = %user_id,
                "duplicate offer for connected user, ignoring"
            );
            return;
        }

        let transport = match self.factory.open(user_id, self.events_tx.clone()).await {
            Ok(t) => t,
            Err(e) => {
                error!(
                    room_id = %self.room_id,
                    user_id = %user_id,
                    error = %e,
                    "failed to open transport"
                );
                return;
            }
        };

        // Attach every live audio feed to the newcomer before the answer
        // is produced, so its negotiated session already carries them.
        for session in self.sessions.values() {
            if let Some(audio) = &session.audio {
                if let Err(e) = transport.forward(session.user_id, audio).await {
                    warn!(
                        room_id = %self.room_id,
                        from = %session.user_id,
                        to = %user_id,
                        error = %e,
                        "failed to attach existing audio"
                    );
                }
            }
        }

        let answer = match transport.apply_offer(&sdp).await {
            Ok(a) => a,
            Err(e) => {
                error!(
                    room_id = %self.room_id,
                    user_id = %user_id,
                    error = %e,
                    "offer negotiation failed"
                );
                transport.close().await;
                return;
            }
        };

        self.sessions
            .insert(user_id, ParticipantSession::new(user_id, transport));
        self.idle_since = None;

        self.publish_answer(user_id, answer).await;

        info!(
            room_id = %self.room_id,
            user_id = %user_id,
            participants = self.sessions.len(),
            "participant joined"
        );
    }

    async fn publish_answer(&self, user_id: UserId, sdp: String) {
        let reply = RelayToGateway::Answer {
            room_id: self.room_id,
            user_id,
            sdp,
        };
        match serde_json::to_string(&reply) {
            Ok(payload) => {
                if let Err(e) = self
                    .answers
                    .send(u64::from(self.room_id.value()), payload)
                    .await
                {
                    error!(
                        room_id = %self.room_id,
                        user_id = %user_id,
                        error = %e,
                        "failed to publish answer"
                    );
                }
            }
            Err(e) => {
                error!(
                    room_id = %self.room_id,
                    user_id = %user_id,
                    error = %e,
                    "failed to encode answer"
                );
            }
        }
    }

    async fn handle_event(&mut self, event: SessionEvent<AudioOf<F>>) {
        let user_id = event.user_id;
        match event.event {
            TransportEvent::AudioArrived(feed) => {
                match self.sessions.get_mut(&user_id) {
                    Some(session) => session.audio = Some(feed.clone()),
                    None => {
                        debug!(
                            room_id = %self.room_id,
                            user_id = %user_id,
                            "audio for departed session, dropping"
                        );
                        return;
                    }
                }

                // Fan out to everyone else; never back to the sender.
                for other in self.sessions.values() {
                    if other.user_id == user_id {
                        continue;
                    }
                    if let Err(e) = other.transport.forward(user_id, &feed).await {
                        warn!(
                            room_id = %self.room_id,
                            from = %user_id,
                            to = %other.user_id,
                            error = %e,
                            "failed to forward audio"
                        );
                    }
                }

                debug!(room_id = %self.room_id, user_id = %user_id, "audio track live");
            }
            TransportEvent::StateChanged(state) => {
                if !state.is_terminal() {
                    debug!(
                        room_id = %self.room_id,
                        user_id = %user_id,
                        state = ?state,
                        "session state changed"
                    );
                    return;
                }
                if let Some(session) = self.sessions.remove(&user_id) {
                    session.transport.close().await;
                    info!(
                        room_id = %self.room_id,
                        user_id = %user_id,
                        participants = self.sessions.len(),
                        "participant left"
                    );
                    if self.sessions.is_empty() {
                        self.idle_since = Some(Instant::now());
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.transport.close().await;
        }
        info!(room_id = %self.room_id, "room worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockFactory;
    use crate::transport::SessionState;
    use parley_bus::{BusReceiver, LocalBus};
    use std::sync::atomic::Ordering;
    use tokio::time::timeout;

    struct Harness {
        factory: Arc<MockFactory>,
        commands: mpsc::Sender<RelayCommand>,
        answers_rx: parley_bus::local::LocalBusReceiver,
        join: tokio::task::JoinHandle<()>,
        room_id: RoomId,
    }

    fn spawn_worker(idle_timeout: Duration) -> Harness {
        let bus = LocalBus::new();
        let answers_rx = bus.subscribe("answers");
        let answers: Arc<dyn BusSender> = Arc::new(bus.sender("answers"));
        let factory = Arc::new(MockFactory::default());
        let room_id = RoomId::new(4242);
        let (tx, rx) = mpsc::channel(16);
        let worker = RoomWorker::new(room_id, Arc::clone(&factory), answers, rx, idle_timeout);
        let join = tokio::spawn(worker.run());
        Harness {
            factory,
            commands: tx,
            answers_rx,
            join,
            room_id,
        }
    }

    async fn next_answer(harness: &mut Harness) -> (u64, RelayToGateway) {
        let msg = timeout(Duration::from_secs(5), harness.answers_rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let parsed = serde_json::from_str(&msg.payload).unwrap();
        (msg.key, parsed)
    }

    async fn offer(harness: &Harness, user: u64) {
        harness
            .commands
            .send(RelayCommand::Offer {
                user_id: UserId::new(user),
                sdp: format!("offer-{user}"),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_offer_produces_answer_keyed_by_room() {
        let mut harness = spawn_worker(Duration::from_secs(60));
        offer(&harness, 1).await;

        let (key, answer) = next_answer(&mut harness).await;
        assert_eq!(key, u64::from(harness.room_id.value()));
        assert_eq!(
            answer,
            RelayToGateway::Answer {
                room_id: harness.room_id,
                user_id: UserId::new(1),
                sdp: "answer:offer-1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_offer_is_ignored() {
        let mut harness = spawn_worker(Duration::from_secs(60));
        offer(&harness, 1).await;
        offer(&harness, 1).await;

        let _ = next_answer(&mut harness).await;
        let second = timeout(Duration::from_millis(200), harness.answers_rx.recv()).await;
        assert!(second.is_err(), "duplicate offer must not produce an answer");
    }

    #[tokio::test]
    async fn test_audio_fans_out_to_others_only() {
        let mut harness = spawn_worker(Duration::from_secs(60));
        offer(&harness, 1).await;
        let _ = next_answer(&mut harness).await;
        offer(&harness, 2).await;
        let _ = next_answer(&mut harness).await;

        harness.factory.emit_audio(UserId::new(1)).await;
        offer(&harness, 3).await;
        let _ = next_answer(&mut harness).await;

        // User 1's live feed reaches user 2 (fan-out) and user 3 (attach
        // at join), never user 1 itself.
        let t1 = harness.factory.transport(UserId::new(1)).unwrap();
        let t2 = harness.factory.transport(UserId::new(2)).unwrap();
        let t3 = harness.factory.transport(UserId::new(3)).unwrap();
        assert!(t1.forwards.lock().is_empty());
        assert_eq!(t2.forwards.lock().as_slice(), &[UserId::new(1)]);
        assert_eq!(t3.forwards.lock().as_slice(), &[UserId::new(1)]);
    }

    #[tokio::test]
    async fn test_terminal_state_removes_participant() {
        let mut harness = spawn_worker(Duration::from_secs(60));
        offer(&harness, 1).await;
        let _ = next_answer(&mut harness).await;

        harness
            .factory
            .emit_state(UserId::new(1), SessionState::Failed)
            .await;

        // A fresh offer for the same user must be accepted again, which
        // proves the old session was removed.
        offer(&harness, 1).await;
        let (_, answer) = next_answer(&mut harness).await;
        assert!(matches!(answer, RelayToGateway::Answer { user_id, .. } if user_id == UserId::new(1)));
    }

    #[tokio::test]
    async fn test_terminal_state_closes_transport() {
        let mut harness = spawn_worker(Duration::from_secs(60));
        offer(&harness, 1).await;
        let _ = next_answer(&mut harness).await;

        let transport = harness.factory.transport(UserId::new(1)).unwrap();
        harness
            .factory
            .emit_state(UserId::new(1), SessionState::Closed)
            .await;

        // Give the worker loop a turn to process the event.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_shuts_down() {
        let harness = spawn_worker(Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(5)).await;
        timeout(Duration::from_secs(5), harness.join)
            .await
            .expect("worker should exit when idle")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_queued_at_idle_deadline_is_served() {
        // Repeated because the loop polls its branches in random order;
        // every run must serve the buffered offer instead of exiting.
        for _ in 0..50 {
            let bus = LocalBus::new();
            let mut answers_rx = bus.subscribe("answers");
            let answers: Arc<dyn BusSender> = Arc::new(bus.sender("answers"));
            let factory = Arc::new(MockFactory::default());
            let (tx, rx) = mpsc::channel(16);
            let worker = RoomWorker::new(
                RoomId::new(4242),
                Arc::clone(&factory),
                answers,
                rx,
                Duration::from_secs(1),
            );

            // The offer lands and the idle deadline passes before the
            // worker polls anything.
            tx.send(RelayCommand::Offer {
                user_id: UserId::new(1),
                sdp: "offer-1".to_string(),
            })
            .await
            .unwrap();
            tokio::time::advance(Duration::from_secs(5)).await;
            let join = tokio::spawn(worker.run());

            let msg = timeout(Duration::from_secs(5), answers_rx.recv())
                .await
                .expect("buffered offer was dropped at the idle deadline")
                .unwrap()
                .unwrap();
            assert_eq!(msg.key, 4242);

            drop(tx);
            join.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_occupied_worker_stays_alive() {
        let mut harness = spawn_worker(Duration::from_secs(1));
        offer(&harness, 1).await;
        let _ = next_answer(&mut harness).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!harness.join.is_finished());

        // Once the last participant leaves, the idle clock starts.
        harness
            .factory
            .emit_state(UserId::new(1), SessionState::Closed)
            .await;
        tokio::time::advance(Duration::from_secs(5)).await;
        timeout(Duration::from_secs(5), harness.join)
            .await
            .expect("worker should exit after the room empties")
            .unwrap();
    }
}
