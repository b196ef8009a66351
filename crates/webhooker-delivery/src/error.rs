//! Error types for webhook delivery.
//!
//! Transport failures carry an explicit [`TransportErrorKind`] so the
//! worker can match every kind exhaustively. Storage failures are kept
//! separate and always mean "try this job again later".

use std::{fmt, time::Duration};

use thiserror::Error;
use webhooker_core::{CoreError, TransportFailure};

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// How an HTTP exchange failed before a response was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// TLS handshake or certificate verification failed.
    Tls,
    /// Connection refused, reset, or the host name did not resolve.
    Connection,
    /// No response within the client timeout.
    Timeout,
    /// Anything else: redirect loops, malformed responses, builder errors.
    Other,
}

impl TransportErrorKind {
    /// Returns the persisted failure tag, or `None` for unclassified errors.
    pub const fn failure(self) -> Option<TransportFailure> {
        match self {
            Self::Tls => Some(TransportFailure::Tls),
            Self::Connection => Some(TransportFailure::Connection),
            Self::Timeout => Some(TransportFailure::Timeout),
            Self::Other => None,
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls => write!(f, "tls"),
            Self::Connection => write!(f, "connection"),
            Self::Timeout => write!(f, "timeout"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Errors raised by the delivery crate.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The HTTP exchange did not produce a response.
    #[error("{kind} transport error: {message}")]
    Transport {
        /// Classified failure kind
        kind: TransportErrorKind,
        /// Underlying error description
        message: String,
    },

    /// Caller input was rejected.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Validation failure description
        message: String,
    },

    /// Referenced record does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// What was missing
        message: String,
    },

    /// Database operation failed.
    #[error("database error: {message}")]
    Database {
        /// Database error message
        message: String,
    },

    /// Invalid client or engine configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },
}

impl DeliveryError {
    /// Creates a transport error.
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport { kind, message: message.into() }
    }

    /// Creates an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether a job that hit this error should be attempted again.
    ///
    /// Storage hiccups and unclassified transport errors are transient.
    /// Classified transport failures are terminal, and so is bad input.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { kind, .. } => matches!(kind, TransportErrorKind::Other),
            Self::Database { .. } => true,
            Self::InvalidInput { .. }
            | Self::NotFound { .. }
            | Self::Configuration { .. }
            | Self::ShutdownTimeout { .. } => false,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput(message) | CoreError::ConstraintViolation(message) => {
                Self::InvalidInput { message }
            },
            CoreError::NotFound(message) => Self::NotFound { message },
            CoreError::Database(message) => Self::Database { message },
        }
    }
}
