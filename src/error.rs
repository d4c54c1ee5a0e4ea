//! Error types for wsrelay

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::error::{CapacityError, ProtocolError};

/// Result type for wsrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur in wsrelay
#[derive(Debug, Error)]
pub enum RelayError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// WebSocket protocol or transport error
    #[error("WebSocket error: {0}")]
    WebSocket(tungstenite::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Upgrade handshake rejected
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// No heartbeat acknowledgment arrived in time
    #[error("Read deadline expired: no heartbeat acknowledgment within {0:?}")]
    ReadTimeout(Duration),

    /// A single write did not complete in time
    #[error("Write deadline expired after {0:?}")]
    WriteTimeout(Duration),

    /// Inbound payload exceeds the configured ceiling
    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// Connection limit reached
    #[error("Connection limit of {0} reached")]
    AtCapacity(usize),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl From<tungstenite::Error> for RelayError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
                Self::PayloadTooLarge {
                    size,
                    limit: max_size,
                }
            }
            tungstenite::Error::Io(e) => Self::Io(e),
            other => Self::WebSocket(other),
        }
    }
}

impl RelayError {
    /// Whether this error only reports that the peer went away
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::WebSocket(
                tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake),
            ) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
