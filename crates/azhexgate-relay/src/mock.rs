//! Test-double transport
//!
//! A mock connection is not wired to any peer. It reads from a buffer the
//! test fills with [`MockBuffers::feed`] and writes into a buffer the test
//! inspects with [`MockBuffers::written`]. The dialer and the acceptor of a
//! mock connection share the same stream and close state.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionInfo};
use crate::error::RelayError;
use crate::queue::{AcceptQueue, EnqueueError, ACCEPT_QUEUE_CAPACITY};

/// Inspectable buffers behind a mock connection
#[derive(Clone, Default)]
pub struct MockBuffers {
    read: Arc<Mutex<BytesMut>>,
    written: Arc<Mutex<BytesMut>>,
}

impl MockBuffers {
    /// Make bytes available to the next reads
    pub fn feed(&self, data: &[u8]) {
        self.read.lock().extend_from_slice(data);
    }

    /// Copy of everything written so far
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().to_vec()
    }

    /// Take everything written so far, leaving the buffer empty
    pub fn take_written(&self) -> Bytes {
        self.written.lock().split().freeze()
    }

    /// Bytes fed but not yet read
    pub fn pending_read(&self) -> usize {
        self.read.lock().len()
    }
}

impl fmt::Debug for MockBuffers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBuffers")
            .field("pending_read", &self.read.lock().len())
            .field("written", &self.written.lock().len())
            .finish()
    }
}

/// Stream over a pair of [`MockBuffers`]; reading an empty buffer is EOF
struct MockStream {
    buffers: MockBuffers,
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut read = self.buffers.read.lock();
        let n = read.len().min(buf.remaining());
        buf.put_slice(&read.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffers.written.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct ListenerInner {
    name: String,
    queue: AcceptQueue,
}

#[derive(Clone)]
pub struct MockListener {
    inner: Arc<ListenerInner>,
}

impl MockListener {
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

    pub fn sender(&self) -> MockSender {
        MockSender {
            listener: self.clone(),
            closed: CancellationToken::new(),
        }
    }

    pub async fn accept(&self, cancel: &CancellationToken) -> Result<Connection, RelayError> {
        self.inner.queue.pop(cancel).await
    }

    pub async fn close(&self) {
        if let Some(pending) = self.inner.queue.close().await {
            for conn in pending {
                conn.close().await;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.queue.is_closed()
    }
}

#[derive(Clone)]
pub struct MockSender {
    listener: MockListener,
    closed: CancellationToken,
}

impl MockSender {
    pub fn name(&self) -> &str {
        self.listener.name()
    }

    /// Create a mock connection and queue a second handle to it on the listener
    pub async fn dial(&self, cancel: &CancellationToken) -> Result<Connection, RelayError> {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        if self.closed.is_cancelled() {
            return Err(RelayError::SenderClosed);
        }

        let buffers = MockBuffers::default();
        let conn = Connection::new(
            MockStream {
                buffers: buffers.clone(),
            },
            ConnectionInfo::Mock(buffers),
        );

        match self.listener.inner.queue.push(conn.share()) {
            Ok(()) => Ok(conn),
            Err(EnqueueError::Closed(_)) => {
                conn.close().await;
                Err(RelayError::ListenerClosed)
            }
            Err(EnqueueError::Full(_)) => {
                tracing::warn!("Accept queue full on {}, dropping connection", self.name());
                conn.close().await;
                Err(RelayError::QueueFull)
            }
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn buffers(conn: &Connection) -> MockBuffers {
        match conn.info() {
            ConnectionInfo::Mock(buffers) => buffers.clone(),
            other => panic!("expected mock connection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dialer_and_acceptor_share_state() {
        let listener = MockListener::new("mock");
        let sender = listener.sender();
        let cancel = CancellationToken::new();

        let mut dialed = sender.dial(&cancel).await.unwrap();
        let accepted = listener.accept(&cancel).await.unwrap();

        dialed.write_all(b"hello").await.unwrap();
        assert_eq!(buffers(&accepted).written(), b"hello");

        accepted.close().await;
        assert!(dialed.is_closed());
    }

    #[tokio::test]
    async fn test_reads_come_from_fed_buffer() {
        let listener = MockListener::new("feed");
        let sender = listener.sender();
        let cancel = CancellationToken::new();

        let mut conn = sender.dial(&cancel).await.unwrap();
        let bufs = buffers(&conn);
        bufs.feed(b"response bytes");
        assert_eq!(bufs.pending_read(), 14);

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"response bytes");
        assert_eq!(bufs.pending_read(), 0);
    }

    #[tokio::test]
    async fn test_take_written_empties_buffer() {
        let listener = MockListener::new("take");
        let mut conn = listener.sender().dial(&CancellationToken::new()).await.unwrap();
        conn.write_all(b"abc").await.unwrap();

        let bufs = buffers(&conn);
        assert_eq!(&bufs.take_written()[..], b"abc");
        assert!(bufs.written().is_empty());
    }

    #[tokio::test]
    async fn test_close_then_accept_and_dial_fail() {
        let listener = MockListener::new("closed");
        let sender = listener.sender();
        listener.close().await;
        listener.close().await;

        let cancel = CancellationToken::new();
        assert!(matches!(
            listener.accept(&cancel).await,
            Err(RelayError::ListenerClosed)
        ));
        assert!(matches!(
            sender.dial(&cancel).await,
            Err(RelayError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn test_full_queue_closes_eleventh() {
        let listener = MockListener::new("full");
        let sender = listener.sender();
        let cancel = CancellationToken::new();

        for _ in 0..ACCEPT_QUEUE_CAPACITY {
            sender.dial(&cancel).await.unwrap();
        }
        assert!(matches!(
            sender.dial(&cancel).await,
            Err(RelayError::QueueFull)
        ));
    }
}
