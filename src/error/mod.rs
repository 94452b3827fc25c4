//! Error types for the Streamline client
//!
//! `ConsumerError` is the single error type flowing through request managers,
//! completable results and background error events. It is `Clone` because the
//! same failure is frequently fanned out to several acknowledgement batches or
//! pending futures.

use thiserror::Error;

mod kafka_error_code;

pub use kafka_error_code::KafkaErrorCode;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Main error type for the client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsumerError {
    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Broker error {code:?}: {message}")]
    Broker {
        code: KafkaErrorCode,
        message: String,
    },

    #[error("Invalid record state: {0}")]
    InvalidRecordState(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Rebalance callback failed: {0}")]
    Callback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Interrupted by wakeup")]
    Wakeup,

    #[error("Client is closed")]
    Closed,
}

impl ConsumerError {
    // ========== Error Context Builders ==========

    /// Create a broker error from a response code, using the optional broker message
    pub fn from_code(code: KafkaErrorCode, message: Option<&str>) -> Self {
        let message = message
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", code));
        match code {
            KafkaErrorCode::InvalidRecordState => ConsumerError::InvalidRecordState(message),
            KafkaErrorCode::RequestTimedOut => ConsumerError::Timeout(message),
            _ => ConsumerError::Broker { code, message },
        }
    }

    /// Create an illegal state error with operation context
    pub fn illegal_state(operation: &str, detail: impl Into<String>) -> Self {
        ConsumerError::IllegalState(format!("{}: {}", operation, detail.into()))
    }

    /// Create a timeout error for an operation that ran past its deadline
    pub fn timeout(operation: &str, timeout_ms: u64) -> Self {
        ConsumerError::Timeout(format!("{} did not complete within {}ms", operation, timeout_ms))
    }

    /// Create a disconnect error for a node
    pub fn disconnected(node_id: i32) -> Self {
        ConsumerError::Disconnected(format!("connection to node {} was lost", node_id))
    }

    /// Create a configuration error with context
    pub fn config(setting: &str, reason: impl Into<String>) -> Self {
        ConsumerError::Config(format!("{}: {}", setting, reason.into()))
    }

    /// Kafka error code equivalent of this error
    pub fn kafka_error_code(&self) -> KafkaErrorCode {
        match self {
            ConsumerError::Disconnected(_) => KafkaErrorCode::NetworkException,
            ConsumerError::Timeout(_) => KafkaErrorCode::RequestTimedOut,
            ConsumerError::Broker { code, .. } => *code,
            ConsumerError::InvalidRecordState(_) => KafkaErrorCode::InvalidRecordState,
            ConsumerError::Authentication(_)
            | ConsumerError::IllegalState(_)
            | ConsumerError::Callback(_)
            | ConsumerError::Config(_)
            | ConsumerError::Wakeup
            | ConsumerError::Closed => KafkaErrorCode::UnknownServerError,
        }
    }

    /// Network failures and retriable broker codes
    pub fn is_retriable(&self) -> bool {
        match self {
            ConsumerError::Disconnected(_) | ConsumerError::Timeout(_) => true,
            ConsumerError::Broker { code, .. } => code.is_retriable(),
            _ => false,
        }
    }

    /// True when the failure came from a lost connection rather than the broker
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ConsumerError::Disconnected(_))
    }
}

impl From<&ConsumerError> for i16 {
    fn from(err: &ConsumerError) -> i16 {
        err.kafka_error_code().as_i16()
    }
}
