use std::fmt;
use std::io;

/// Errors produced by the communication core.
///
/// Socket-level failures are not returned from the send APIs directly;
/// they surface through the connection status callback and the error
/// counters. Everything a caller can observe synchronously maps onto one
/// of these variants.
#[derive(Debug)]
pub enum CommError {
    NotConnected,
    ConnectTimeout,
    ReadError(String),
    WriteError(String),
    PeerClosed,
    Serialization(String),
    AcquireTimeout,
    PoolShutdown,
    BatcherStopped,
    ValidationFailed(String),
    Internal(String),
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not connected"),
            Self::ConnectTimeout => write!(f, "Connection attempt timed out"),
            Self::ReadError(e) => write!(f, "Read error: {}", e),
            Self::WriteError(e) => write!(f, "Write error: {}", e),
            Self::PeerClosed => write!(f, "Peer closed the connection"),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::AcquireTimeout => write!(f, "Timed out acquiring a connection"),
            Self::PoolShutdown => write!(f, "Pool has been shut down"),
            Self::BatcherStopped => write!(f, "Batcher is not running"),
            Self::ValidationFailed(e) => write!(f, "Connection validation failed: {}", e),
            Self::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl std::error::Error for CommError {}

impl From<io::Error> for CommError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::ConnectTimeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => Self::PeerClosed,
            io::ErrorKind::NotConnected => Self::NotConnected,
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CommError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CommError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        Self::ConnectTimeout
    }
}

pub type Result<T> = std::result::Result<T, CommError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mapping() {
        let err: CommError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, CommError::PeerClosed));

        let err: CommError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(err, CommError::ConnectTimeout));
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(CommError::NotConnected.to_string(), "Not connected");
        assert_eq!(
            CommError::WriteError("broken".into()).to_string(),
            "Write error: broken"
        );
    }
}
