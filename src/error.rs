//! Error types for hublink

use crate::protocol::NackReason;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// hublink error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid packet or response
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Checksum mismatch
    #[error("Checksum error: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumError {
        /// Expected checksum value
        expected: u8,
        /// Actual checksum value
        actual: u8,
    },

    /// Module answered with a negative acknowledgment
    #[error("NACK received: {reason:?}")]
    Nack {
        /// Reason code carried by the NACK
        reason: NackReason,
    },

    /// The bus has shut down and accepts no further traffic
    #[error("Bus has shut down")]
    BusShutDown,

    /// Module initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The NACK reason, if this error carries one.
    pub fn nack_reason(&self) -> Option<NackReason> {
        match self {
            Error::Nack { reason } => Some(*reason),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}
