use std::io;

use thiserror::Error;

/// Errors produced by relay transports and the forwarding engine
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Sender closed")]
    SenderClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Accept queue full")]
    QueueFull,

    #[error("Invalid relay endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    #[error("Failed to connect to local service {addr}: {source}")]
    LocalDial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RelayError {
    pub fn invalid_endpoint(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// I/O error reported by a [`Connection`](crate::Connection) used after close
    pub fn closed_io() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, RelayError::ConnectionClosed)
    }

    /// Whether an I/O error means the connection was closed rather than failed
    pub fn is_closed_io(err: &io::Error) -> bool {
        if let Some(inner) = err.get_ref() {
            if let Some(RelayError::ConnectionClosed) = inner.downcast_ref::<RelayError>() {
                return true;
            }
        }
        matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::UnexpectedEof
        )
    }

    /// Closed-resource condition (connection, listener or sender used after close)
    pub fn is_closed(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::ListenerClosed | Self::SenderClosed => true,
            Self::Io(e) => Self::is_closed_io(e),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_io_roundtrip() {
        let err = RelayError::closed_io();
        assert!(RelayError::is_closed_io(&err));
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(RelayError::Io(err).is_closed());
    }

    #[test]
    fn test_other_errors_are_not_closed() {
        let err = io::Error::new(io::ErrorKind::InvalidData, "garbage");
        assert!(!RelayError::is_closed_io(&err));
        assert!(!RelayError::Cancelled.is_closed());
        assert!(RelayError::ListenerClosed.is_closed());
    }
}
