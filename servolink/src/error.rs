//! Error types for servolink.

use std::io;
use thiserror::Error;

/// Result type for servolink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for servolink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The port could not be opened or the device did not answer the handshake.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The link dropped while an operation was in progress.
    #[error("Connection lost")]
    ConnectionLost,

    /// No device handle is open.
    #[error("Not connected")]
    NotConnected,

    /// No acknowledgement within the bounded wait.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or unexpected response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device answered with an `ERR` reply.
    #[error("Rejected by device: {0}")]
    Rejected(String),

    /// Checksum mismatch during firmware verification.
    #[error("Integrity error: expected CRC {expected:#010x}, {}", reported(.actual))]
    Integrity {
        /// CRC-32 of the host image.
        expected: u32,
        /// CRC-32 reported by the device, if it reported one.
        actual: Option<u32>,
    },

    /// Another session already owns the device handle.
    #[error("Device busy: {0}")]
    Busy(String),

    /// The operation was cancelled by the caller.
    #[error("Cancelled")]
    Cancelled,

    /// Command parameters outside the accepted range, or a request the
    /// session cannot serve.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Firmware image could not be used.
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// Unsupported operation on this platform.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

fn reported(actual: &Option<u32>) -> String {
    actual.map_or_else(
        || "device rejected the image".to_string(),
        |crc| format!("device reported {crc:#010x}"),
    )
}

impl Error {
    /// Whether the error means the transport is unusable.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) | Self::ConnectionLost | Self::NotConnected => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            _ => false,
        }
    }

    /// Whether the error came from a missing or malformed acknowledgement.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Protocol(_) | Self::Rejected(_))
    }
}
