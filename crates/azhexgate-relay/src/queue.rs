use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::RelayError;

/// Pending connections a listener holds before `accept` picks them up
pub const ACCEPT_QUEUE_CAPACITY: usize = 10;

/// Why a connection could not be queued; the connection is handed back
pub(crate) enum EnqueueError {
    Closed(Connection),
    Full(Connection),
}

/// Bounded queue of accepted connections
///
/// The sender half sits behind a lock and is taken exactly once on close, so
/// `push`, `pop` and `close` never touch a closed channel.
pub(crate) struct AcceptQueue {
    tx: Mutex<Option<mpsc::Sender<Connection>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    closed: CancellationToken,
}

impl AcceptQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a connection without waiting
    pub(crate) fn push(&self, conn: Connection) -> Result<(), EnqueueError> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(EnqueueError::Closed(conn));
        };

        tx.try_send(conn).map_err(|e| match e {
            TrySendError::Full(conn) => EnqueueError::Full(conn),
            TrySendError::Closed(conn) => EnqueueError::Closed(conn),
        })
    }

    /// Wait for the next connection
    ///
    /// Cancellation wins over a connection that is already queued.
    pub(crate) async fn pop(&self, cancel: &CancellationToken) -> Result<Connection, RelayError> {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        if self.closed.is_cancelled() {
            return Err(RelayError::ListenerClosed);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            _ = self.closed.cancelled() => Err(RelayError::ListenerClosed),
            conn = async { self.rx.lock().await.recv().await } => {
                conn.ok_or(RelayError::ListenerClosed)
            }
        }
    }

    /// Close the queue, returning whatever was still pending
    ///
    /// Returns `None` if the queue was already closed. A parked `pop` holds the
    /// receiver until it observes `closed`, so the drain waits for the lock.
    pub(crate) async fn close(&self) -> Option<Vec<Connection>> {
        let tx = self.tx.lock().take()?;
        drop(tx);
        self.closed.cancel();

        let mut rx = self.rx.lock().await;
        rx.close();
        let mut pending = Vec::new();
        while let Ok(conn) = rx.try_recv() {
            pending.push(conn);
        }
        Some(pending)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
