//! Redis Pub/Sub bus backend.
//!
//! Each topic maps to one Redis channel (`parley:{topic}`). Publishing
//! goes through a background task that owns the connection and reconnects
//! with exponential backoff; subscribing runs a companion task that feeds
//! a local channel. Messages published while Redis is unreachable are
//! queued in a bounded buffer and flushed after reconnection.
//!
//! Delivery is fire-and-forget Pub/Sub: signaling offers and answers are
//! only meaningful while the originating connection is alive, so there is
//! no replay of messages missed during an outage.

use async_trait::async_trait;
use futures::StreamExt;
use parley_core::{Error, Result};
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusMessage, BusReceiver, BusSender};

/// Timeout for individual Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Capacity of the per-sender publish buffer. Sends block when full
/// (e.g. during a prolonged Redis outage).
const PUBLISH_CHANNEL_CAPACITY: usize = 10_000;

fn channel_name(topic: &str) -> String {
    format!("parley:{topic}")
}

/// Connection factory for the Redis-backed bus.
pub struct RedisBus {
    client: Client,
    cancel: CancellationToken,
}

impl RedisBus {
    /// Open a client and verify the server is reachable. Startup-time
    /// callers treat a failure here as fatal.
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            Client::open(url).map_err(|e| Error::Bus(format!("invalid bus url: {e}")))?;

        let mut conn = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Bus("timed out connecting to bus".to_string()))?
        .map_err(|e| Error::Bus(format!("failed to connect to bus: {e}")))?;

        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::Bus(format!("bus ping failed: {e}")))?;

        info!(url = %url, "connected to message bus");

        Ok(Self {
            client,
            cancel: CancellationToken::new(),
        })
    }

    /// Token for external shutdown signaling.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop all publisher and subscriber tasks spawned from this bus.
    pub fn shutdown(&self) {
        info!("shutting down bus tasks");
        self.cancel.cancel();
    }

    /// Producer handle for a topic. Spawns the publisher task.
    #[must_use]
    pub fn sender(&self, topic: &str) -> RedisBusSender {
        let (tx, rx) = mpsc::channel::<BusMessage>(PUBLISH_CHANNEL_CAPACITY);
        tokio::spawn(run_publisher(
            self.client.clone(),
            channel_name(topic),
            rx,
            self.cancel.clone(),
        ));
        RedisBusSender { topic: topic.to_string(), tx }
    }

    /// Consumer handle for a topic. Spawns the subscriber task.
    #[must_use]
    pub fn receiver(&self, topic: &str) -> RedisBusReceiver {
        let (tx, rx) = mpsc::unbounded_channel::<BusMessage>();
        tokio::spawn(run_subscriber_loop(
            self.client.clone(),
            channel_name(topic),
            tx,
            self.cancel.clone(),
        ));
        RedisBusReceiver { rx }
    }
}

#[derive(Clone)]
pub struct RedisBusSender {
    topic: String,
    tx: mpsc::Sender<BusMessage>,
}

#[async_trait]
impl BusSender for RedisBusSender {
    async fn send(&self, key: u64, payload: String) -> Result<()> {
        self.tx
            .send(BusMessage { key, payload })
            .await
            .map_err(|_| Error::Bus(format!("publisher for topic '{}' stopped", self.topic)))
    }
}

pub struct RedisBusReceiver {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

#[async_trait]
impl BusReceiver for RedisBusReceiver {
    async fn recv(&mut self) -> Result<Option<BusMessage>> {
        Ok(self.rx.recv().await)
    }
}

/// Publisher task: owns the outbound connection, reconnects with
/// exponential backoff and retries the message that was in flight when
/// the connection broke.
async fn run_publisher(
    client: Client,
    channel: String,
    mut rx: mpsc::Receiver<BusMessage>,
    cancel: CancellationToken,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;
    let mut retry_message: Option<BusMessage> = None;

    loop {
        let mut conn = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => {
                backoff_secs = INITIAL_BACKOFF_SECS;
                conn
            }
            Ok(Err(e)) => {
                error!(
                    error = %e,
                    channel = %channel,
                    backoff_secs = backoff_secs,
                    "failed to get bus connection for publishing, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }
            Err(_) => {
                error!(
                    channel = %channel,
                    backoff_secs = backoff_secs,
                    "timed out getting bus connection for publishing, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }
        };

        debug!(channel = %channel, "bus publisher (re)connected");

        // Flush the message that failed right before the reconnect.
        if let Some(msg) = retry_message.take() {
            if let Err(e) = publish_message(&mut conn, &channel, &msg).await {
                warn!(error = %e, channel = %channel, "retry publish failed, reconnecting");
                retry_message = Some(msg);
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }
        }

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(channel = %channel, "bus publisher cancelled");
                    return;
                }
                msg = rx.recv() => msg,
            };
            match msg {
                Some(msg) => {
                    if let Err(e) = publish_message(&mut conn, &channel, &msg).await {
                        error!(
                            error = %e,
                            channel = %channel,
                            key = msg.key,
                            "failed to publish, saving for retry after reconnect"
                        );
                        retry_message = Some(msg);
                        break;
                    }
                }
                None => {
                    debug!(channel = %channel, "bus publisher channel closed, exiting");
                    return;
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

async fn publish_message(
    conn: &mut redis::aio::MultiplexedConnection,
    channel: &str,
    msg: &BusMessage,
) -> Result<()> {
    let body = serde_json::to_string(msg)?;
    let subscribers: usize = timeout(
        Duration::from_secs(REDIS_TIMEOUT_SECS),
        conn.publish(channel, &body),
    )
    .await
    .map_err(|_| Error::Bus("timed out publishing".to_string()))?
    .map_err(|e| Error::Bus(format!("publish failed: {e}")))?;

    debug!(channel = %channel, key = msg.key, subscribers = subscribers, "message published");
    Ok(())
}

/// Describes how one subscriber connection ended, driving backoff.
enum SubscriberExit {
    /// Connection was healthy before it dropped; reset backoff.
    Disconnected,
    /// Could not connect or subscribe; keep increasing backoff.
    ConnectFailed(String),
    /// The local consumer went away; stop the task.
    ReceiverDropped,
}

async fn run_subscriber_loop(
    client: Client,
    channel: String,
    tx: mpsc::UnboundedSender<BusMessage>,
    cancel: CancellationToken,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;

    loop {
        if cancel.is_cancelled() {
            debug!(channel = %channel, "bus subscriber cancelled");
            return;
        }

        match run_subscriber(&client, &channel, &tx, &cancel).await {
            SubscriberExit::Disconnected => {
                error!(
                    channel = %channel,
                    "bus subscriber stream ended, reconnecting after {}s",
                    INITIAL_BACKOFF_SECS
                );
                backoff_secs = INITIAL_BACKOFF_SECS;
            }
            SubscriberExit::ConnectFailed(e) => {
                error!(
                    error = %e,
                    channel = %channel,
                    backoff_secs = backoff_secs,
                    "bus subscriber failed to connect, retrying after backoff"
                );
            }
            SubscriberExit::ReceiverDropped => {
                debug!(channel = %channel, "bus subscriber consumer dropped, exiting");
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(channel = %channel, "bus subscriber cancelled during backoff");
                return;
            }
            _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
        }
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

async fn run_subscriber(
    client: &Client,
    channel: &str,
    tx: &mpsc::UnboundedSender<BusMessage>,
    cancel: &CancellationToken,
) -> SubscriberExit {
    let mut pubsub = match timeout(
        Duration::from_secs(REDIS_TIMEOUT_SECS),
        client.get_async_pubsub(),
    )
    .await
    {
        Ok(Ok(ps)) => ps,
        Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.to_string()),
        Err(_) => {
            return SubscriberExit::ConnectFailed("timed out getting pubsub connection".to_string())
        }
    };

    match timeout(
        Duration::from_secs(REDIS_TIMEOUT_SECS),
        pubsub.subscribe(channel),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.to_string()),
        Err(_) => return SubscriberExit::ConnectFailed("timed out subscribing".to_string()),
    }

    info!(channel = %channel, "bus subscriber connected");

    let mut stream = pubsub.on_message();

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return SubscriberExit::ReceiverDropped,
            msg = stream.next() => msg,
        };
        let Some(msg) = msg else {
            return SubscriberExit::Disconnected;
        };

        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, channel = %channel, "invalid payload encoding, discarding");
                continue;
            }
        };

        match serde_json::from_str::<BusMessage>(&payload) {
            Ok(bus_msg) => {
                if tx.send(bus_msg).is_err() {
                    return SubscriberExit::ReceiverDropped;
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    channel = %channel,
                    payload = %payload,
                    "undecodable bus message, discarding"
                );
            }
        }
    }
}
