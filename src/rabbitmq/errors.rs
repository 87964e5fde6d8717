// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// AMQP reply code for a missing queue or exchange.
pub const REPLY_NOT_FOUND: u16 = 404;
/// AMQP reply code for a declaration that conflicts with an existing entity.
pub const REPLY_PRECONDITION_FAILED: u16 = 406;

/// Coarse classification of a failure reported by a broker backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// The broker could not be reached at all.
    Unreachable,
    ConnectionClosed,
    ChannelClosed,
    /// The broker replied 404 NOT_FOUND.
    NotFound,
    /// The broker replied 406 PRECONDITION_FAILED.
    PreconditionFailed,
    Other,
}

/// Error raised by a broker backend (lapin or the in-process broker).
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct BrokerError {
    kind: BrokerErrorKind,
    message: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> BrokerErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True when the handle the error came from is already gone.
    pub fn is_closed(&self) -> bool {
        matches!(
            self.kind,
            BrokerErrorKind::ConnectionClosed | BrokerErrorKind::ChannelClosed
        )
    }
}

impl From<LapinError> for BrokerError {
    fn from(error: LapinError) -> Self {
        let kind = match &error {
            LapinError::ProtocolError(amqp_error) => match amqp_error.get_id() {
                REPLY_NOT_FOUND => BrokerErrorKind::NotFound,
                REPLY_PRECONDITION_FAILED => BrokerErrorKind::PreconditionFailed,
                _ => BrokerErrorKind::Other,
            },
            LapinError::InvalidChannelState(_) => BrokerErrorKind::ChannelClosed,
            LapinError::InvalidConnectionState(_) | LapinError::IOError(_) => {
                BrokerErrorKind::ConnectionClosed
            }
            _ => BrokerErrorKind::Other,
        };

        BrokerError::new(kind, error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("RabbitMQ connection error: {0}")]
    Connection(String),

    #[error("RabbitMQ channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Queue declaration error: {0}")]
    QueueDeclaration(String),

    #[error("RabbitMQ publish error: {0}")]
    Publish(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Consumer callback error: {0}")]
    ConsumerCallback(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("Connection timeout: {0}")]
    Timeout(String),

    #[error("RabbitMQ error: {0}")]
    Broker(BrokerError),
}

// Custom Result type for broker operations
pub type Result<T> = std::result::Result<T, QueueError>;

impl From<BrokerError> for QueueError {
    fn from(error: BrokerError) -> Self {
        match error.kind() {
            BrokerErrorKind::Unreachable | BrokerErrorKind::ConnectionClosed => {
                QueueError::Connection(error.message)
            }
            BrokerErrorKind::ChannelClosed => QueueError::ChannelUnavailable(error.message),
            BrokerErrorKind::NotFound => QueueError::QueueNotFound(error.message),
            BrokerErrorKind::PreconditionFailed => QueueError::QueueDeclaration(error.message),
            BrokerErrorKind::Other => QueueError::Broker(error),
        }
    }
}

impl From<LapinError> for QueueError {
    fn from(error: LapinError) -> Self {
        BrokerError::from(error).into()
    }
}

impl From<Elapsed> for QueueError {
    fn from(_: Elapsed) -> Self {
        QueueError::Timeout("Connection timed out".to_string())
    }
}
