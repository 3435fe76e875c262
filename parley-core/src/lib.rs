//! Shared foundation for the parley voice-chat services: identifiers,
//! the error type, configuration loading and logging setup.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;

pub use config::Config;
pub use error::{Error, Result};
pub use models::{RoomId, UserId};
