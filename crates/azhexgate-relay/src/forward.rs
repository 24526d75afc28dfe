//! Stream forwarding between relay connections and local services

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::RelayError;
use crate::transport::RelayListener;

pub const COPY_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    RelayToLocal,
    LocalToRelay,
}

/// Bytes moved by one forwarding pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub relay_to_local: u64,
    pub local_to_relay: u64,
}

/// Copy until EOF or error, flushing after every chunk
///
/// Returns the bytes copied together with the outcome, so a failed copy
/// still reports how far it got.
pub async fn copy_stream<R, W>(reader: &mut R, writer: &mut W) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return (total, Ok(())),
            Ok(n) => n,
            Err(e) => return (total, Err(e)),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return (total, Err(e));
        }
        if let Err(e) = writer.flush().await {
            return (total, Err(e));
        }
        total += n as u64;
    }
}

/// Pump bytes both ways until one side finishes, then close both
///
/// EOF or a closed connection on either side is a clean finish. Only an
/// error from the direction that finished first is reported.
pub async fn join(relay: Connection, local: Connection) -> Result<ForwardStats, RelayError> {
    let relay_closer = relay.closer();
    let local_closer = local.closer();

    let (mut relay_read, mut relay_write) = tokio::io::split(relay);
    let (mut local_read, mut local_write) = tokio::io::split(local);

    let (tx, mut rx) = mpsc::channel(2);

    let done = tx.clone();
    tokio::spawn(async move {
        let (n, result) = copy_stream(&mut relay_read, &mut local_write).await;
        let _ = done.send((Direction::RelayToLocal, n, result)).await;
    });
    tokio::spawn(async move {
        let (n, result) = copy_stream(&mut local_read, &mut relay_write).await;
        let _ = tx.send((Direction::LocalToRelay, n, result)).await;
    });

    let mut stats = ForwardStats::default();
    let mut record = |direction: Direction, n: u64| match direction {
        Direction::RelayToLocal => stats.relay_to_local = n,
        Direction::LocalToRelay => stats.local_to_relay = n,
    };

    let first = rx.recv().await;

    relay_closer.close().await;
    local_closer.close().await;

    let mut outcome = Ok(());
    if let Some((direction, n, result)) = first {
        record(direction, n);
        if let Err(e) = result {
            if !RelayError::is_closed_io(&e) {
                tracing::debug!("Forwarding {:?} failed: {}", direction, e);
                outcome = Err(RelayError::Io(e));
            }
        }
    }

    // The other direction now fails on its closed side; only its count matters
    if let Some((direction, n, _)) = rx.recv().await {
        record(direction, n);
    }

    outcome.map(|()| stats)
}

/// Dial `local_addr` and join it with `conn`
///
/// If the local service is unreachable the relay side is closed so the
/// remote caller sees the failure instead of waiting.
pub async fn forward_to_local(conn: Connection, local_addr: &str) -> Result<ForwardStats, RelayError> {
    let stream = match TcpStream::connect(local_addr).await {
        Ok(s) => s,
        Err(e) => {
            conn.close().await;
            return Err(RelayError::LocalDial {
                addr: local_addr.to_string(),
                source: e,
            });
        }
    };
    let _ = stream.set_nodelay(true);

    join(conn, Connection::from_stream(stream)).await
}

/// Accept loop: forward every accepted connection to `local_addr`
///
/// Returns `Ok` when `cancel` fires or the listener closes; any other accept
/// failure ends the loop with that error. Failures of individual forwarding
/// pairs are logged and do not stop the loop.
pub async fn serve(
    listener: RelayListener,
    local_addr: String,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    tracing::info!(
        "Forwarding {} ({}) to {}",
        listener.name(),
        listener.kind(),
        local_addr
    );

    loop {
        let conn = match listener.accept(&cancel).await {
            Ok(conn) => conn,
            Err(RelayError::Cancelled) => {
                tracing::info!("Stopped forwarding {}", listener.name());
                return Ok(());
            }
            Err(RelayError::ListenerClosed) => {
                tracing::info!("Listener {} closed", listener.name());
                return Ok(());
            }
            Err(e) => {
                tracing::error!("Accept on {} failed: {}", listener.name(), e);
                return Err(e);
            }
        };

        let local_addr = local_addr.clone();
        tokio::spawn(async move {
            match forward_to_local(conn, &local_addr).await {
                Ok(stats) => tracing::debug!(
                    "Connection finished ({} bytes in, {} bytes out)",
                    stats.relay_to_local,
                    stats.local_to_relay
                ),
                Err(e) => tracing::warn!("Forwarding failed: {}", e),
            }
        });
    }
}
