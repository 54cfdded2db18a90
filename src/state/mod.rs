//! Last-known appliance state, merged from partial status messages

pub mod device_state;

pub use device_state::{DeviceSnapshot, StateModel};

#[cfg(test)]
mod tests;
