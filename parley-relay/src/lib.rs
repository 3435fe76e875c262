//! Media relay tier: per-room workers that exchange SDP with the
//! signaling gateway over the bus and fan each participant's audio out
//! to everyone else in the room.

pub mod dispatcher;
pub mod rtc;
pub mod session;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use dispatcher::RelayDispatcher;
pub use rtc::{AudioFeed, RtcFactory, RtcTransport};
pub use transport::{
    SessionEvent, SessionState, SessionTransport, TransportEvent, TransportFactory,
};
pub use worker::{RelayCommand, RoomWorker};
