//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the reader device
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Timed out waiting for '{0}'")]
    Timeout(String),

    #[error("Not connected to reader device")]
    NotConnected,

    #[error("No reader device found on any serial port")]
    DeviceNotFound,

    #[error("Invalid reply from device")]
    InvalidReply,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
