//! # MQTT Integration Module
//!
//! Everything that touches the broker or the appliance's wire format. The
//! appliance only speaks publish/subscribe: commands go out on
//! `{root}/{serial}/command`, every status report comes back on
//! `{root}/{serial}/status/...`.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection parameters and derived topics
//! ├── message_manager.rs  - Inbound decoding and outbound envelopes
//! └── mqtt_handler.rs     - Transport trait and the rumqttc-backed handler
//! ```
//!
//! The handler owns one receive thread per connection. That thread never
//! interprets payloads; it posts each [`message_manager::InboundMessage`] to
//! the session's channel in delivery order and goes back to the network.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::{ConnectionConfig, TopicSet};
pub use message_manager::{
    Change, CommandFields, DeviceMessage, InboundMessage, MessageKind, Readings,
};
pub use mqtt_handler::{ConnectionState, MQTTStatus, MqttHandler, Transport};
