use async_trait::async_trait;
use parley_core::Result;
use serde::{Deserialize, Serialize};

/// A single bus message: a numeric correlation key plus a JSON payload.
///
/// The gateway keys offers by user id; room workers key answers by room
/// id. The key travels alongside the payload so consumers can partition
/// or trace without parsing the JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub key: u64,
    pub payload: String,
}

/// Producer half of a topic. Cloned handles may publish concurrently;
/// messages from one handle keep their send order.
#[async_trait]
pub trait BusSender: Send + Sync {
    async fn send(&self, key: u64, payload: String) -> Result<()>;
}

/// Consumer half of a topic. `Ok(None)` means the bus has shut down and
/// no further messages will arrive.
#[async_trait]
pub trait BusReceiver: Send {
    async fn recv(&mut self) -> Result<Option<BusMessage>>;
}
