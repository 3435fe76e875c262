//! Message-bus layer connecting the signaling gateway to the relay tier.
//!
//! The bus moves opaque `(key, payload)` pairs over named topics. Payloads
//! are JSON produced and consumed by the endpoints; the bus itself never
//! inspects them, so a malformed payload is an endpoint-level protocol
//! violation rather than a bus failure.

pub mod bus;
pub mod local;
pub mod messages;
pub mod redis;

pub use bus::{BusMessage, BusReceiver, BusSender};
pub use local::LocalBus;
pub use messages::{GatewayToRelay, RelayToGateway};
pub use redis::RedisBus;
