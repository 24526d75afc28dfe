//! Mock TCP service for raw byte forwarding tests

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Behavior of the mock TCP service
#[derive(Clone, Debug)]
pub enum TcpServiceMode {
    /// Echo back all received data
    Echo,
    /// Read once, write a fixed response, then close
    FixedResponse(Vec<u8>),
    /// Read until EOF without answering
    Accumulate,
    /// Answer an HTTP upgrade request with `101`, then echo
    UpgradeEcho,
}

/// A mock TCP service on an ephemeral port
pub struct MockTcpService {
    addr: SocketAddr,
    /// Bytes received, one entry per finished connection
    received: Arc<RwLock<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl MockTcpService {
    /// Start an echo service
    pub async fn start() -> Self {
        Self::start_with_mode(TcpServiceMode::Echo).await
    }

    pub async fn start_with_mode(mode: TcpServiceMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock TCP service");
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(RwLock::new(Vec::new()));

        let log = received.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let log = log.clone();
                        let mode = mode.clone();
                        tokio::spawn(async move {
                            let data = handle_connection(stream, mode).await;
                            log.write().push(data);
                        });
                    }
                    Err(e) => {
                        tracing::error!("TCP accept error: {}", e);
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            received,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    /// Number of connections that have finished
    pub fn connection_count(&self) -> usize {
        self.received.read().len()
    }

    pub fn total_bytes_received(&self) -> usize {
        self.received.read().iter().map(Vec::len).sum()
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.read().clone()
    }
}

impl Drop for MockTcpService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(mut stream: TcpStream, mode: TcpServiceMode) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];

    match mode {
        TcpServiceMode::Echo => loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    if let Err(e) = stream.write_all(&buf[..n]).await {
                        tracing::debug!("Echo write error: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Echo read error: {}", e);
                    break;
                }
            }
        },
        TcpServiceMode::FixedResponse(response) => {
            if let Ok(n) = stream.read(&mut buf).await {
                received.extend_from_slice(&buf[..n]);
            }
            if let Err(e) = stream.write_all(&response).await {
                tracing::debug!("Fixed response write error: {}", e);
            }
            let _ = stream.shutdown().await;
        }
        TcpServiceMode::Accumulate => {
            let _ = stream.read_to_end(&mut received).await;
        }
        TcpServiceMode::UpgradeEcho => {
            let Some(head_len) = read_head(&mut stream, &mut received).await else {
                return received;
            };
            let response = b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n";
            if stream.write_all(response).await.is_err() {
                return received;
            }

            // Bytes that arrived behind the request head belong to the upgraded stream
            let early = received[head_len..].to_vec();
            if !early.is_empty() && stream.write_all(&early).await.is_err() {
                return received;
            }
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }

    received
}

/// Read until the end of an HTTP request head; returns the head length
async fn read_head(stream: &mut TcpStream, received: &mut Vec<u8>) -> Option<usize> {
    let mut buf = [0u8; 1024];
    loop {
        if let Some(pos) = received.windows(4).position(|w| w == b"\r\n\r\n") {
            return Some(pos + 4);
        }
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => received.extend_from_slice(&buf[..n]),
        }
    }
}
