//! Crate error types.

use std::io;
use std::sync::Arc;

/// Client errors from producing to a Kafka broker.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The broker refused the connection while (re-)connecting.
    #[error("the broker refused the connection: {0}")]
    BrokerReconnect(#[source] Arc<io::Error>),
    /// Error while interacting with the broker connection.
    #[error("error while interacting with the broker: {0}")]
    BrokerError(#[source] BrokerErrorKind),
    /// Error while encoding a batch of records.
    #[error("error while encoding a batch of records: {0}")]
    EncodingError(String),
    /// The producer configuration could not be loaded.
    #[error("invalid producer configuration: {0}")]
    InvalidConfig(String),
    /// Topics must be non-empty.
    #[error("the topic must be a non-empty string")]
    InvalidTopic,
    /// A single message exceeds the configured max message size.
    #[error("message of {size} bytes exceeds the max message size of {max} bytes")]
    MessageTooLarge {
        /// The encoded size of the offending message.
        size: usize,
        /// The configured limit.
        max: usize,
    },
    /// Produce requests must include at least 1 record.
    #[error("produce requests must include at least 1 record")]
    ProducerMessagesEmpty,
}

/// Broker connection level error kind.
///
/// Connect outcomes are delivered to every waiter of an in-flight attempt, so this type is `Clone`
/// and holds IO errors behind an `Arc`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BrokerErrorKind {
    /// The broker actively refused a connection attempt.
    #[error("connection refused: {0}")]
    Refused(Arc<io::Error>),
    /// The socket was never opened or has been closed by the broker.
    #[error("the socket is closed")]
    SocketClosed,
    /// Any other transport level error.
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),
    /// A connection was opened but could not be prepared for use.
    #[error("unexpected error while connecting: {0}")]
    Unexpected(String),
    /// The connection task is gone.
    #[error("the client is disconnected")]
    Disconnected,
}

impl BrokerErrorKind {
    /// Build an error kind from an IO error observed while connecting.
    pub(crate) fn from_connect_error(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::ConnectionRefused {
            Self::Refused(Arc::new(err))
        } else {
            Self::Transport(Arc::new(err))
        }
    }

    /// Build an error kind from an IO error observed while writing to a live socket.
    pub(crate) fn from_write_error(err: io::Error) -> Self {
        if is_dead_socket(&err) {
            Self::SocketClosed
        } else {
            Self::Transport(Arc::new(err))
        }
    }

    /// True if this error means the socket was already closed, the sole trigger for a reconnect.
    pub fn is_socket_closed(&self) -> bool {
        matches!(self, Self::SocketClosed)
    }
}

impl From<BrokerErrorKind> for ClientError {
    fn from(kind: BrokerErrorKind) -> Self {
        match kind {
            BrokerErrorKind::Refused(err) => Self::BrokerReconnect(err),
            kind => Self::BrokerError(kind),
        }
    }
}

/// Check if a write error indicates the peer has already closed the socket.
fn is_dead_socket(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof
    )
}
