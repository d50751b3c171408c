//! Error types for the Plume client library

use crate::commands::ServerError;
use crate::compression::CompressionError;

/// Main error type for Plume client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connection-related errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Protocol-related errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Consumer-specific errors
    #[error("Consumer error: {message}")]
    Consumer { message: String },

    /// The consumer has been closed and can no longer be used
    #[error("Consumer is already closed")]
    AlreadyClosed,

    /// No broker connection is currently established
    #[error("Consumer is not connected to a broker")]
    NotConnected,

    /// A frame could not be written during the named operation
    #[error("Connection failed while sending {op}")]
    ConnectionFailedOnSend { op: &'static str },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Error relayed from the broker
    #[error("Broker error {code:?}: {message}")]
    Server { code: ServerError, message: String },

    /// Payload decompression failed
    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),
}

impl ClientError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new consumer error
    pub fn consumer<S: Into<String>>(message: S) -> Self {
        Self::Consumer {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Check if the operation that produced this error can be retried
    /// against a fresh connection.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Io(_) => true,
            Self::Timeout { .. } => true,
            Self::ConnectionFailedOnSend { .. } => true,
            Self::Server { code, .. } => code.is_retriable(),
            _ => false,
        }
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Io(_) | Self::ConnectionFailedOnSend { .. }
        )
    }
}
