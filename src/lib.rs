//! Client-side session for a publish/subscribe controlled fan appliance
//!
//! The appliance only talks MQTT: commands are published to it and every
//! answer comes back as a status message. [`session::DeviceSession`] turns
//! that stream into fire-and-forget commands, blocking and async state
//! requests with timeouts, and a background listener that keeps a merged
//! snapshot of the appliance's state.

pub mod commands;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod session;
pub mod state;

pub use error::{CommandError, DecodeError, SessionError};
pub use session::{DeviceSession, StateReport};
