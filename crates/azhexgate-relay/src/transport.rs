use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::azure::{AzureListener, AzureSender};
use crate::connection::Connection;
use crate::error::RelayError;
use crate::memory::{MemoryListener, MemorySender};
use crate::mock::{MockListener, MockSender};

/// Which transport backs a listener or sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Memory,
    Mock,
    Azure,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Memory => write!(f, "memory"),
            TransportKind::Mock => write!(f, "mock"),
            TransportKind::Azure => write!(f, "azure"),
        }
    }
}

/// Listener over any transport, picked once when the tunnel is created
#[derive(Clone)]
pub enum RelayListener {
    Memory(MemoryListener),
    Mock(MockListener),
    Azure(AzureListener),
}

impl RelayListener {
    /// Wait for the next connection
    ///
    /// Fails with `Cancelled` once `cancel` fires (even when a connection is
    /// queued) and with `ListenerClosed` after `close`.
    pub async fn accept(&self, cancel: &CancellationToken) -> Result<Connection, RelayError> {
        match self {
            RelayListener::Memory(l) => l.accept(cancel).await,
            RelayListener::Mock(l) => l.accept(cancel).await,
            RelayListener::Azure(l) => l.accept(cancel).await,
        }
    }

    /// Stop accepting; idempotent
    pub async fn close(&self) {
        match self {
            RelayListener::Memory(l) => l.close().await,
            RelayListener::Mock(l) => l.close().await,
            RelayListener::Azure(l) => l.close().await,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RelayListener::Memory(l) => l.name(),
            RelayListener::Mock(l) => l.name(),
            RelayListener::Azure(l) => l.name(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            RelayListener::Memory(_) => TransportKind::Memory,
            RelayListener::Mock(_) => TransportKind::Mock,
            RelayListener::Azure(_) => TransportKind::Azure,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            RelayListener::Memory(l) => l.is_closed(),
            RelayListener::Mock(l) => l.is_closed(),
            RelayListener::Azure(l) => l.is_closed(),
        }
    }
}

impl From<MemoryListener> for RelayListener {
    fn from(l: MemoryListener) -> Self {
        RelayListener::Memory(l)
    }
}

impl From<MockListener> for RelayListener {
    fn from(l: MockListener) -> Self {
        RelayListener::Mock(l)
    }
}

impl From<AzureListener> for RelayListener {
    fn from(l: AzureListener) -> Self {
        RelayListener::Azure(l)
    }
}

/// Sender over any transport
#[derive(Clone)]
pub enum RelaySender {
    Memory(MemorySender),
    Mock(MockSender),
    Azure(AzureSender),
}

impl RelaySender {
    /// Open a new connection to the listener side
    pub async fn dial(&self, cancel: &CancellationToken) -> Result<Connection, RelayError> {
        match self {
            RelaySender::Memory(s) => s.dial(cancel).await,
            RelaySender::Mock(s) => s.dial(cancel).await,
            RelaySender::Azure(s) => s.dial(cancel).await,
        }
    }

    /// Later dials fail immediately; idempotent
    pub fn close(&self) {
        match self {
            RelaySender::Memory(s) => s.close(),
            RelaySender::Mock(s) => s.close(),
            RelaySender::Azure(s) => s.close(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RelaySender::Memory(s) => s.name(),
            RelaySender::Mock(s) => s.name(),
            RelaySender::Azure(s) => s.name(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            RelaySender::Memory(_) => TransportKind::Memory,
            RelaySender::Mock(_) => TransportKind::Mock,
            RelaySender::Azure(_) => TransportKind::Azure,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            RelaySender::Memory(s) => s.is_closed(),
            RelaySender::Mock(s) => s.is_closed(),
            RelaySender::Azure(s) => s.is_closed(),
        }
    }
}

impl From<MemorySender> for RelaySender {
    fn from(s: MemorySender) -> Self {
        RelaySender::Memory(s)
    }
}

impl From<MockSender> for RelaySender {
    fn from(s: MockSender) -> Self {
        RelaySender::Mock(s)
    }
}

impl From<AzureSender> for RelaySender {
    fn from(s: AzureSender) -> Self {
        RelaySender::Azure(s)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_memory_through_enums() {
        let memory = MemoryListener::new("hc-1");
        let sender: RelaySender = memory.sender().into();
        let listener: RelayListener = memory.into();
        assert_eq!(listener.kind(), TransportKind::Memory);
        assert_eq!(sender.name(), "hc-1");

        let cancel = CancellationToken::new();
        let mut dialed = sender.dial(&cancel).await.unwrap();
        let mut accepted = listener.accept(&cancel).await.unwrap();

        dialed.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");

        listener.close().await;
        assert!(listener.is_closed());
        sender.close();
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn test_mock_through_enums() {
        let mock = MockListener::new("m");
        let listener = RelayListener::from(mock.clone());
        let sender = RelaySender::from(mock.sender());
        assert_eq!(sender.kind(), TransportKind::Mock);
        assert_eq!(listener.kind().to_string(), "mock");

        let cancel = CancellationToken::new();
        sender.dial(&cancel).await.unwrap();
        assert!(listener.accept(&cancel).await.is_ok());
    }
}
