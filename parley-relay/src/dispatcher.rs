//! Relay dispatcher: consumes the gateway→relay topic and keeps exactly
//! one live worker task per active room.

use parley_bus::{BusReceiver, BusSender, GatewayToRelay};
use parley_core::RoomId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::transport::TransportFactory;
use crate::worker::{RelayCommand, RoomWorker};

/// Capacity of each worker's command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Pause before retrying after a bus receive error.
const BUS_ERROR_BACKOFF: Duration = Duration::from_secs(1);

struct WorkerHandle {
    commands: mpsc::Sender<RelayCommand>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    fn is_dead(&self) -> bool {
        self.join.is_finished() || self.commands.is_closed()
    }
}

/// Routes offers to room workers, spawning and reaping them on demand.
pub struct RelayDispatcher<F: TransportFactory> {
    factory: Arc<F>,
    answers: Arc<dyn BusSender>,
    workers: HashMap<RoomId, WorkerHandle>,
    idle_timeout: Duration,
}

impl<F: TransportFactory> RelayDispatcher<F> {
    pub fn new(factory: Arc<F>, answers: Arc<dyn BusSender>, idle_timeout: Duration) -> Self {
        Self {
            factory,
            answers,
            workers: HashMap::new(),
            idle_timeout,
        }
    }

    /// Consume the offer topic until the bus closes, then shut every
    /// worker down.
    pub async fn run<R: BusReceiver>(mut self, mut offers: R) {
        loop {
            match offers.recv().await {
                Ok(Some(message)) => self.handle_message(&message.payload).await,
                Ok(None) => {
                    info!("offer topic closed, stopping dispatcher");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "bus receive failed, backing off");
                    tokio::time::sleep(BUS_ERROR_BACKOFF).await;
                }
            }
        }

        for (room_id, handle) in self.workers.drain() {
            if handle.commands.send(RelayCommand::Shutdown).await.is_err() {
                debug!(room_id = %room_id, "worker already gone at shutdown");
            }
        }
    }

    async fn handle_message(&mut self, payload: &str) {
        let message = match serde_json::from_str::<GatewayToRelay>(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "malformed dispatch message, discarding");
                return;
            }
        };

        match message {
            GatewayToRelay::Offer {
                room_id,
                user_id,
                sdp,
            } => self.route_offer(room_id, RelayCommand::Offer { user_id, sdp }).await,
            GatewayToRelay::KillRoom { room_id } => {
                debug!(room_id = %room_id, "killroom not implemented, discarding");
            }
            GatewayToRelay::KickUser { room_id, user_id } => {
                debug!(
                    room_id = %room_id,
                    user_id = %user_id,
                    "kickuser not implemented, discarding"
                );
            }
        }
    }

    async fn route_offer(&mut self, room_id: RoomId, command: RelayCommand) {
        // Evict a handle whose worker has already exited, so the offer
        // lands on a fresh worker instead of a dead channel.
        if self
            .workers
            .get(&room_id)
            .is_some_and(WorkerHandle::is_dead)
        {
            self.workers.remove(&room_id);
            debug!(room_id = %room_id, "evicted finished worker");
        }

        let factory = Arc::clone(&self.factory);
        let answers = Arc::clone(&self.answers);
        let idle_timeout = self.idle_timeout;
        let handle = self
            .workers
            .entry(room_id)
            .or_insert_with(|| spawn_worker(room_id, factory, answers, idle_timeout));

        let Err(send_err) = handle.commands.send(command).await else {
            return;
        };

        // The worker shut down between the liveness check and the send.
        // Respawn once and retry; a second failure is dropped.
        warn!(room_id = %room_id, "worker channel closed mid-send, respawning");
        let handle = spawn_worker(
            room_id,
            Arc::clone(&self.factory),
            Arc::clone(&self.answers),
            self.idle_timeout,
        );
        if handle.commands.send(send_err.0).await.is_err() {
            error!(room_id = %room_id, "respawned worker rejected offer, dropping");
        }
        self.workers.insert(room_id, handle);
    }
}

fn spawn_worker<F: TransportFactory>(
    room_id: RoomId,
    factory: Arc<F>,
    answers: Arc<dyn BusSender>,
    idle_timeout: Duration,
) -> WorkerHandle {
    info!(room_id = %room_id, "spawning room worker");
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let worker = RoomWorker::new(room_id, factory, answers, rx, idle_timeout);
    let join = tokio::spawn(worker.run());
    WorkerHandle { commands: tx, join }
}
