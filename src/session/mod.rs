//! # Device Session
//!
//! Turns the appliance's one-way publish/subscribe traffic into call-style
//! operations.
//!
//! ```text
//! caller ──publish_command──▶ Transport ──▶ broker ──▶ appliance
//! appliance ──▶ broker ──▶ Transport ──channel──▶ MessageRouter
//!                                                  ├─▶ StateModel
//!                                                  └─▶ RequestSlot ──▶ waiting caller
//! ```
//!
//! At most one request/response call is in flight per session; a second one
//! fails with [`crate::error::SessionError::Busy`].

pub mod device_session;
pub mod listener;
pub mod pending;
pub mod router;

pub use device_session::{DeviceSession, StateReport};
pub use listener::{BackgroundListener, Idle, ListenerSettings, Running, Stopped};
pub use pending::{Delivery, Predicate, RequestSlot, Ticket};
pub use router::MessageRouter;
