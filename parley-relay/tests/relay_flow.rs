//! End-to-end signaling flow over an in-process bus: gateway registry and
//! answer loop on one side, dispatcher and room workers on the other.

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_bus::{BusSender, GatewayToRelay, LocalBus};
use parley_core::{Result, RoomId, UserId};
use parley_gateway::protocol::ServerMessage;
use parley_gateway::registry::{Member, RoomRegistry};
use parley_gateway::run_answer_loop;
use parley_relay::transport::{
    SessionEvent, SessionTransport, TransportEvent, TransportFactory,
};
use parley_relay::RelayDispatcher;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Clone)]
struct FakeAudio {
    owner: UserId,
}

struct FakeTransport {
    events: mpsc::Sender<SessionEvent<FakeAudio>>,
    forwards: Mutex<Vec<UserId>>,
}

#[async_trait]
impl SessionTransport for FakeTransport {
    type Audio = FakeAudio;

    async fn apply_offer(&self, sdp: &str) -> Result<String> {
        Ok(format!("answer:{sdp}"))
    }

    async fn forward(&self, from: UserId, _source: &FakeAudio) -> Result<()> {
        self.forwards.lock().push(from);
        Ok(())
    }

    async fn close(&self) {}
}

#[derive(Default)]
struct FakeFactory {
    transports: Mutex<HashMap<UserId, Arc<FakeTransport>>>,
    open_count: AtomicUsize,
}

#[async_trait]
impl TransportFactory for FakeFactory {
    type Transport = FakeTransport;

    async fn open(
        &self,
        user_id: UserId,
        events: mpsc::Sender<SessionEvent<FakeAudio>>,
    ) -> Result<Arc<FakeTransport>> {
        let transport = Arc::new(FakeTransport {
            events,
            forwards: Mutex::new(Vec::new()),
        });
        self.transports.lock().insert(user_id, Arc::clone(&transport));
        self.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(transport)
    }
}

impl FakeFactory {
    fn transport(&self, user_id: UserId) -> Arc<FakeTransport> {
        self.transports
            .lock()
            .get(&user_id)
            .cloned()
            .expect("transport not opened")
    }

    async fn emit_audio(&self, user_id: UserId) {
        let transport = self.transport(user_id);
        transport
            .events
            .send(SessionEvent {
                user_id,
                event: TransportEvent::AudioArrived(FakeAudio { owner: user_id }),
            })
            .await
            .expect("worker event channel closed");
    }
}

struct World {
    registry: Arc<RoomRegistry>,
    factory: Arc<FakeFactory>,
    offers: Box<dyn BusSender>,
}

impl World {
    fn start() -> Self {
        let bus = LocalBus::new();
        let offers_rx = bus.subscribe("offers");
        let answers_rx = bus.subscribe("answers");

        let registry = Arc::new(RoomRegistry::new());
        tokio::spawn(run_answer_loop(Arc::clone(&registry), answers_rx));

        let factory = Arc::new(FakeFactory::default());
        let answers: Arc<dyn BusSender> = Arc::new(bus.sender("answers"));
        let dispatcher =
            RelayDispatcher::new(Arc::clone(&factory), answers, Duration::from_secs(60));
        tokio::spawn(dispatcher.run(offers_rx));

        Self {
            registry,
            factory,
            offers: Box::new(bus.sender("offers")),
        }
    }

    /// Register a gateway member and publish its offer, the way the
    /// connection handler does after the handshake.
    async fn join(&self, room: RoomId, name: &str) -> (UserId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let user_id = self.registry.next_user_id();
        self.registry.join(
            room,
            Member {
                user_id,
                name: name.to_string(),
                sender: tx,
            },
        );
        let offer = GatewayToRelay::Offer {
            room_id: room,
            user_id,
            sdp: format!("offer-{name}"),
        };
        self.offers
            .send(user_id.value(), serde_json::to_string(&offer).unwrap())
            .await
            .unwrap();
        (user_id, rx)
    }
}

async fn expect_answer(rx: &mut mpsc::UnboundedReceiver<ServerMessage>, room: RoomId) -> String {
    let message = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for answer")
        .expect("connection channel closed");
    match message {
        ServerMessage::Answer { sdp, room_id } => {
            assert_eq!(room_id, room);
            sdp
        }
        other => panic!("expected answer, got {other:?}"),
    }
}

#[tokio::test]
async fn test_offer_round_trips_to_the_originating_member() {
    let world = World::start();
    let room = RoomId::new(4242);

    let (_alice, mut alice_rx) = world.join(room, "alice").await;

    let sdp = expect_answer(&mut alice_rx, room).await;
    assert_eq!(sdp, "answer:offer-alice");
}

#[tokio::test]
async fn test_one_room_shares_a_worker_across_members() {
    let world = World::start();
    let room = RoomId::new(4242);

    let (_alice, mut alice_rx) = world.join(room, "alice").await;
    expect_answer(&mut alice_rx, room).await;
    let (_bob, mut bob_rx) = world.join(room, "bob").await;
    expect_answer(&mut bob_rx, room).await;

    assert_eq!(world.factory.open_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_duplicate_offer_is_ignored() {
    let world = World::start();
    let room = RoomId::new(4242);

    let (alice, mut alice_rx) = world.join(room, "alice").await;
    expect_answer(&mut alice_rx, room).await;

    // Same user offers again; the worker keeps the existing session.
    let repeat = GatewayToRelay::Offer {
        room_id: room,
        user_id: alice,
        sdp: "offer-again".to_string(),
    };
    world
        .offers
        .send(alice.value(), serde_json::to_string(&repeat).unwrap())
        .await
        .unwrap();

    // A later member still gets served, and no second transport was
    // opened for the duplicate.
    let (_bob, mut bob_rx) = world.join(room, "bob").await;
    expect_answer(&mut bob_rx, room).await;
    assert_eq!(world.factory.open_count.load(Ordering::SeqCst), 2);
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_audio_fans_out_to_everyone_but_the_speaker() {
    let world = World::start();
    let room = RoomId::new(4242);

    let (alice, mut alice_rx) = world.join(room, "alice").await;
    expect_answer(&mut alice_rx, room).await;
    let (bob, mut bob_rx) = world.join(room, "bob").await;
    expect_answer(&mut bob_rx, room).await;
    let (carol, mut carol_rx) = world.join(room, "carol").await;
    expect_answer(&mut carol_rx, room).await;

    world.factory.emit_audio(alice).await;
    world.factory.emit_audio(bob).await;
    world.factory.emit_audio(carol).await;

    // Event delivery is async; poll until every session saw both peers.
    timeout(Duration::from_secs(5), async {
        loop {
            let done = [alice, bob, carol].iter().all(|user| {
                world.factory.transport(*user).forwards.lock().len() == 2
            });
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("fan-out never completed");

    for user in [alice, bob, carol] {
        let forwards = world.factory.transport(user).forwards.lock().clone();
        assert!(!forwards.contains(&user), "session received its own audio");
        assert_eq!(forwards.len(), 2);
    }
}

#[tokio::test]
async fn test_stale_answer_does_not_break_routing() {
    let world = World::start();
    let room = RoomId::new(4242);

    // An offer for a user who was never registered at the gateway: the
    // relay answers, the answer loop finds nobody and discards it.
    let ghost = GatewayToRelay::Offer {
        room_id: room,
        user_id: UserId::new(999),
        sdp: "offer-ghost".to_string(),
    };
    world
        .offers
        .send(999, serde_json::to_string(&ghost).unwrap())
        .await
        .unwrap();

    // A real member joining afterwards still gets its answer.
    let (_alice, mut alice_rx) = world.join(room, "alice").await;
    let sdp = expect_answer(&mut alice_rx, room).await;
    assert_eq!(sdp, "answer:offer-alice");
}
