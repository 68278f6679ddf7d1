//! Error types for the Crownstone UART library

use thiserror::Error;

/// The main error type for Crownstone UART operations
#[derive(Error, Debug)]
pub enum Error {
    /// Connection-related errors (port cannot be opened, transport went away)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serial port errors
    #[cfg(feature = "serial")]
    #[error("Serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol errors (malformed frames or messages)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A payload could not be decoded into its structured form
    #[error("Decode error: {0}")]
    Decode(String),

    /// A component was handed a value it can never accept, e.g. a
    /// non-frame event on the raw frame topic
    #[error("Contract violation: {0}")]
    Contract(String),

    /// Timeout waiting for a reply
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// No transport is active
    #[error("Not connected")]
    NotConnected,

    /// Channel send error
    #[error("Channel error: {0}")]
    Channel(String),
}

impl Error {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    /// Create a contract violation error
    pub fn contract(msg: impl Into<String>) -> Self {
        Error::Contract(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }
}
