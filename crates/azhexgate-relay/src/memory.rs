//! In-process transport backed by pipes
//!
//! Used for local-mode tunnels, where gateway and client share a process, and
//! as the substrate for forwarding tests.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionInfo};
use crate::error::RelayError;
use crate::queue::{AcceptQueue, EnqueueError, ACCEPT_QUEUE_CAPACITY};

/// Bytes buffered in each direction before a writer waits for the reader
pub const MEMORY_PIPE_CAPACITY: usize = 64 * 1024;

struct ListenerInner {
    name: String,
    queue: AcceptQueue,
}

/// Accepts connections dialed by a [`MemorySender`] bound to it
#[derive(Clone)]
pub struct MemoryListener {
    inner: Arc<ListenerInner>,
}

impl MemoryListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                name: name.into(),
                queue: AcceptQueue::new(ACCEPT_QUEUE_CAPACITY),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Sender bound to this listener
    pub fn sender(&self) -> MemorySender {
        MemorySender {
            listener: self.clone(),
            closed: CancellationToken::new(),
        }
    }

    pub async fn accept(&self, cancel: &CancellationToken) -> Result<Connection, RelayError> {
        self.inner.queue.pop(cancel).await
    }

    /// Close the listener and any connections still waiting to be accepted
    pub async fn close(&self) {
        if let Some(pending) = self.inner.queue.close().await {
            tracing::debug!(
                "Memory listener {} closed ({} pending connections dropped)",
                self.inner.name,
                pending.len()
            );
            for conn in pending {
                conn.close().await;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.queue.is_closed()
    }
}

/// Dials connections onto a [`MemoryListener`]
#[derive(Clone)]
pub struct MemorySender {
    listener: MemoryListener,
    closed: CancellationToken,
}

impl MemorySender {
    pub fn name(&self) -> &str {
        self.listener.name()
    }

    /// Create a pipe pair, queue one end on the listener and return the other
    pub async fn dial(&self, cancel: &CancellationToken) -> Result<Connection, RelayError> {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        if self.closed.is_cancelled() {
            return Err(RelayError::SenderClosed);
        }

        // `duplex` is two independent pipes, one per direction
        let (sender_end, listener_end) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
        let info = ConnectionInfo::Memory {
            tunnel: self.name().to_string(),
        };
        let local = Connection::new(sender_end, info.clone());
        let remote = Connection::new(listener_end, info);

        match self.listener.inner.queue.push(remote) {
            Ok(()) => {
                tracing::debug!("Memory connection dialed on {}", self.name());
                Ok(local)
            }
            Err(EnqueueError::Closed(remote)) => {
                remote.close().await;
                local.close().await;
                Err(RelayError::ListenerClosed)
            }
            Err(EnqueueError::Full(remote)) => {
                tracing::warn!("Accept queue full on {}, dropping connection", self.name());
                remote.close().await;
                local.close().await;
                Err(RelayError::QueueFull)
            }
        }
    }

    /// Mark the sender closed; later dials fail (idempotent)
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
