//! # Error Types
//!
//! Custom error types for Icarus GCS using `thiserror`.

use std::time::Duration;
use thiserror::Error;

use crate::connection::TransportKind;

/// Main error type for Icarus GCS
#[derive(Debug, Error)]
pub enum IcarusError {
    /// Serial device could not be opened (permission, not found, busy)
    #[error("Failed to open serial port {path}: {reason}")]
    PortOpen { path: String, reason: String },

    /// Serial device could not be closed cleanly
    #[error("Failed to close serial port {path}: {reason}")]
    PortClose { path: String, reason: String },

    /// Operation requires an established connection
    #[error("{0} link is not connected")]
    NotConnected(TransportKind),

    /// A connect attempt is already in flight
    #[error("{0} link is already connecting")]
    AlreadyConnecting(TransportKind),

    /// The link is already up
    #[error("{0} link is already connected")]
    AlreadyConnected(TransportKind),

    /// Broker answered CONNECT with a non-zero return code
    #[error("Broker refused connection (code {code}): {reason}")]
    BrokerConnect { code: u8, reason: String },

    /// No CONNACK arrived within the connect timeout
    #[error("Broker did not acknowledge connection within {0:?}")]
    BrokerTimeout(Duration),

    /// Telemetry key outside the fixed schema
    #[error("Unknown telemetry field: {0}")]
    UnknownField(String),

    /// SUBACK/UNSUBACK whose packet id matches no pending request
    #[error("Acknowledgement for unknown {kind} request (packet id {pkid})")]
    UnknownSubscriptionAck { kind: &'static str, pkid: u16 },

    /// Broker granted a failure code for a subscription
    #[error("Broker rejected subscription to {0}")]
    SubscriptionRejected(String),

    /// Baud rate must be a positive integer
    #[error("Invalid baud rate: {0}")]
    InvalidBaudRate(u32),

    /// I/O failure on an open serial link
    #[error("Serial error: {0}")]
    Serial(String),

    /// Broker client request or network failure
    #[error("Broker error: {0}")]
    Broker(String),

    /// Inbound payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Map update could not be encoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Icarus GCS
pub type Result<T> = std::result::Result<T, IcarusError>;
