use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::RelayError;
use crate::mock::MockBuffers;

/// How long `close` waits for a graceful shutdown before dropping the stream
pub(crate) const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Anything a [`Connection`] can carry
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Where a connection came from
#[derive(Debug, Clone)]
pub enum ConnectionInfo {
    /// One end of an in-process pipe pair
    Memory { tunnel: String },
    /// Test double with inspectable buffers
    Mock(MockBuffers),
    /// Relay WebSocket (sender socket or rendezvous socket)
    Azure { id: String },
    /// Any other wrapped byte stream (local TCP, upgraded HTTP)
    Stream,
}

struct Shared {
    io: Mutex<Option<Box<dyn ByteStream>>>,
    closed: CancellationToken,
}

/// A live duplex byte stream
///
/// Reads and writes go through `AsyncRead`/`AsyncWrite`. Closing, from this
/// handle or from a [`ConnectionCloser`] held by another task, drops the
/// underlying stream and wakes any pending read or write, which then fail
/// with a closed-connection error instead of blocking.
pub struct Connection {
    shared: Arc<Shared>,
    info: ConnectionInfo,
    read_closed: Pin<Box<WaitForCancellationFutureOwned>>,
    write_closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl Connection {
    pub(crate) fn new<S: ByteStream>(stream: S, info: ConnectionInfo) -> Self {
        let shared = Arc::new(Shared {
            io: Mutex::new(Some(Box::new(stream))),
            closed: CancellationToken::new(),
        });
        Self::with_shared(shared, info)
    }

    fn with_shared(shared: Arc<Shared>, info: ConnectionInfo) -> Self {
        let read_closed = Box::pin(shared.closed.clone().cancelled_owned());
        let write_closed = Box::pin(shared.closed.clone().cancelled_owned());
        Self {
            shared,
            info,
            read_closed,
            write_closed,
        }
    }

    /// Wrap an arbitrary byte stream, e.g. a local TCP socket
    pub fn from_stream<S: ByteStream>(stream: S) -> Self {
        Self::new(stream, ConnectionInfo::Stream)
    }

    /// Second handle onto the same stream and close state
    pub(crate) fn share(&self) -> Self {
        Self::with_shared(self.shared.clone(), self.info.clone())
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Handle that can close this connection from another task
    pub fn closer(&self) -> ConnectionCloser {
        ConnectionCloser {
            shared: self.shared.clone(),
        }
    }

    /// Close the connection (idempotent)
    pub async fn close(&self) {
        self.closer().close().await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Cloneable close handle for a [`Connection`]
#[derive(Clone)]
pub struct ConnectionCloser {
    shared: Arc<Shared>,
}

impl ConnectionCloser {
    /// Drop the underlying stream after a best-effort graceful shutdown
    ///
    /// A peer that stops reading cannot hold this up for longer than
    /// `SHUTDOWN_TIMEOUT`.
    pub async fn close(&self) {
        let stream = self.shared.io.lock().take();
        self.shared.closed.cancel();

        if let Some(mut stream) = stream {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, stream.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("Shutdown while closing connection: {}", e),
                Err(_) => tracing::debug!("Shutdown timed out, dropping connection"),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shared.closed.is_cancelled() || this.read_closed.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(RelayError::closed_io()));
        }

        let mut io = this.shared.io.lock();
        match io.as_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Err(RelayError::closed_io())),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.shared.closed.is_cancelled() || this.write_closed.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(RelayError::closed_io()));
        }

        let mut io = this.shared.io.lock();
        match io.as_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(RelayError::closed_io())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shared.closed.is_cancelled() {
            return Poll::Ready(Err(RelayError::closed_io()));
        }

        let mut io = this.shared.io.lock();
        match io.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Err(RelayError::closed_io())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut io = this.shared.io.lock();
        match io.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
