//! In-process bus backend for single-node deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parley_core::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::{BusMessage, BusReceiver, BusSender};

/// Topic fabric backed by per-topic unbounded channels.
///
/// Any number of cloned senders may publish to a topic; each topic has a
/// single consumer. Subscribing to a topic again replaces the previous
/// consumer.
#[derive(Clone, Default)]
pub struct LocalBus {
    topics: Arc<DashMap<String, mpsc::UnboundedSender<BusMessage>>>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer handle for a topic. The topic does not need a consumer
    /// yet; sends before `subscribe` fail with `Error::Bus`.
    #[must_use]
    pub fn sender(&self, topic: &str) -> LocalBusSender {
        LocalBusSender {
            topic: topic.to_string(),
            topics: Arc::clone(&self.topics),
        }
    }

    /// Attach the consumer for a topic.
    #[must_use]
    pub fn subscribe(&self, topic: &str) -> LocalBusReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.insert(topic.to_string(), tx);
        debug!(topic = %topic, "local bus consumer attached");
        LocalBusReceiver { rx }
    }
}

#[derive(Clone)]
pub struct LocalBusSender {
    topic: String,
    topics: Arc<DashMap<String, mpsc::UnboundedSender<BusMessage>>>,
}

#[async_trait]
impl BusSender for LocalBusSender {
    async fn send(&self, key: u64, payload: String) -> Result<()> {
        let tx = self
            .topics
            .get(&self.topic)
            .ok_or_else(|| Error::Bus(format!("no consumer on topic '{}'", self.topic)))?;
        tx.send(BusMessage { key, payload })
            .map_err(|_| Error::Bus(format!("topic '{}' closed", self.topic)))
    }
}

pub struct LocalBusReceiver {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

#[async_trait]
impl BusReceiver for LocalBusReceiver {
    async fn recv(&mut self) -> Result<Option<BusMessage>> {
        Ok(self.rx.recv().await)
    }
}
