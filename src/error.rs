//! Error definitions for the device session

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the device session and its collaborators
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Missing or invalid connection parameters, fatal before connecting
    #[error("Configuration error: {0}")]
    Config(String),

    /// The broker connection could not be established
    #[error("Connection error: {0}")]
    Connection(String),

    /// A publish was attempted while disconnected or rejected by the client queue
    #[error("Publish error: {0}")]
    Publish(String),

    /// No matching response arrived before the deadline
    #[error("No response from device within {0:?}")]
    Timeout(Duration),

    /// Another request/response call is still in flight on this session
    #[error("Another request is already pending on this session")]
    Busy,

    /// The session was torn down while a request was waiting
    #[error("Session disconnected while waiting for a response")]
    Disconnected,

    /// The waiting caller gave up before a response arrived
    #[error("Request was cancelled")]
    Cancelled,

    /// The blocking worker running a request failed
    #[error("Worker error: {0}")]
    Worker(String),
}

/// Reasons an inbound payload is rejected by the router
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Payload has no \"msg\" field")]
    MissingType,
}

/// Validation failures in the command layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Cannot parse '{0}' as boolean (expected true/false, t/f, 1/0, on/off, yes/no, y/n)")]
    InvalidBoolean(String),

    #[error("Fan speed must be between 0 and 10, got {0}")]
    FanSpeedOutOfRange(u32),

    #[error("Invalid time format: {0}")]
    InvalidTime(String),

    #[error("Sleep timer must be between 0 and 540 minutes (0 = off), got {0}")]
    SleepTimerOutOfRange(u32),

    #[error("Invalid oscillation width: {0}")]
    InvalidWidth(String),

    #[error("Heading must be between 0 and 359 degrees, got {0}")]
    HeadingOutOfRange(u32),

    #[error("Invalid oscillation angle: {0}")]
    InvalidAngle(String),
}
