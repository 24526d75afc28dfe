use std::sync::Arc;

use azhexgate_protocol::{AcceptCommand, ListenerCommand, AUTH_HEADER};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::endpoint::RelayEndpoint;
use super::ws_io::WsIo;
use crate::connection::{Connection, ConnectionInfo};
use crate::error::RelayError;
use crate::queue::{AcceptQueue, EnqueueError, ACCEPT_QUEUE_CAPACITY};

type ControlSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Control-channel lifecycle of an [`AzureListener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// Not connected yet, or the last connect attempt failed
    Disconnected,
    Connecting,
    Connected,
    /// Closed by the caller or lost; never reconnects
    Closed,
}

struct ListenerInner {
    endpoint: RelayEndpoint,
    name: String,
    token: Option<String>,
    listener_id: String,
    queue: AcceptQueue,
    state: Mutex<ControlState>,
    connect_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl ListenerInner {
    /// Mark closed and close the queue; returns connections nobody accepted
    async fn shut(&self) -> Option<Vec<Connection>> {
        *self.state.lock() = ControlState::Closed;
        self.shutdown.cancel();
        self.queue.close().await
    }
}

/// Hybrid Connection listener
///
/// The control channel is opened by the first `accept`. Accept notifications
/// arriving on it are turned into rendezvous connections and queued; a lost
/// control channel closes the listener for good.
#[derive(Clone)]
pub struct AzureListener {
    inner: Arc<ListenerInner>,
}

impl AzureListener {
    pub fn new(endpoint: RelayEndpoint, name: impl Into<String>, token: Option<String>) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                endpoint,
                name: name.into(),
                token: token.filter(|t| !t.is_empty()),
                listener_id: uuid::Uuid::new_v4().to_string(),
                queue: AcceptQueue::new(ACCEPT_QUEUE_CAPACITY),
                state: Mutex::new(ControlState::Disconnected),
                connect_lock: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.inner.endpoint
    }

    /// Instance ID sent as `sb-hc-id`, fixed for the listener's lifetime
    pub fn listener_id(&self) -> &str {
        &self.inner.listener_id
    }

    pub fn state(&self) -> ControlState {
        *self.inner.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.queue.is_closed()
    }

    pub async fn accept(&self, cancel: &CancellationToken) -> Result<Connection, RelayError> {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        if self.inner.queue.is_closed() {
            return Err(RelayError::ListenerClosed);
        }

        self.ensure_control_channel(cancel).await?;
        self.inner.queue.pop(cancel).await
    }

    /// Close the control channel and every connection still waiting in the queue
    pub async fn close(&self) {
        if let Some(pending) = self.inner.shut().await {
            tracing::info!("Listener for {} closed", self.inner.name);
            for conn in pending {
                conn.close().await;
            }
        }
    }

    async fn ensure_control_channel(&self, cancel: &CancellationToken) -> Result<(), RelayError> {
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            guard = self.inner.connect_lock.lock() => guard,
        };

        {
            let mut state = self.inner.state.lock();
            match *state {
                ControlState::Connected => return Ok(()),
                ControlState::Closed => return Err(RelayError::ListenerClosed),
                ControlState::Disconnected | ControlState::Connecting => {
                    *state = ControlState::Connecting;
                }
            }
        }

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            _ = self.inner.shutdown.cancelled() => Err(RelayError::ListenerClosed),
            result = self.connect_control_channel() => result,
        };

        match connected {
            Ok(ws) => {
                let mut state = self.inner.state.lock();
                if *state == ControlState::Closed {
                    // Closed while connecting; dropping the socket ends it
                    return Err(RelayError::ListenerClosed);
                }
                *state = ControlState::Connected;
                drop(state);

                tracing::info!(
                    "Control channel connected for {} (listener {})",
                    self.inner.name,
                    self.inner.listener_id
                );
                tokio::spawn(run_control_channel(self.inner.clone(), ws));
                Ok(())
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                if *state != ControlState::Closed {
                    *state = ControlState::Disconnected;
                }
                if !matches!(e, RelayError::Cancelled) {
                    tracing::warn!("Control channel for {} failed: {}", self.inner.name, e);
                }
                Err(e)
            }
        }
    }

    async fn connect_control_channel(&self) -> Result<ControlSocket, RelayError> {
        let url = self
            .inner
            .endpoint
            .listen_url(&self.inner.name, &self.inner.listener_id)?;
        let mut request = url.as_str().into_client_request()?;

        if let Some(token) = &self.inner.token {
            let name = HeaderName::from_bytes(AUTH_HEADER.as_bytes())
                .map_err(|e| RelayError::Protocol(e.to_string()))?;
            let value = HeaderValue::from_str(token)
                .map_err(|e| RelayError::Protocol(format!("invalid listener token: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(ws)
    }
}

/// Read signaling messages until the relay goes away or the listener closes
async fn run_control_channel(inner: Arc<ListenerInner>, ws: ControlSocket) {
    let (mut sink, mut stream) = ws.split();

    let reason = loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break None;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_command(&inner, &text),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Binary(_))) => {
                    break Some("unexpected binary message".to_string());
                }
                Some(Ok(Message::Close(_))) | None => {
                    break Some("closed by relay".to_string());
                }
                Some(Err(e)) => break Some(e.to_string()),
            }
        }
    };

    if let Some(reason) = reason {
        tracing::error!("Control channel for {} lost: {}", inner.name, reason);
        if let Some(pending) = inner.shut().await {
            for conn in pending {
                conn.close().await;
            }
        }
    } else {
        tracing::debug!("Control channel for {} shut down", inner.name);
    }
}

fn handle_command(inner: &Arc<ListenerInner>, text: &str) {
    let command = match ListenerCommand::from_json(text) {
        Ok(command) => command,
        Err(e) => {
            tracing::warn!("Ignoring malformed control message on {}: {}", inner.name, e);
            return;
        }
    };

    match command.rendezvous() {
        Some(accept) => {
            tracing::debug!("Accept notification {} on {}", accept.id, inner.name);
            tokio::spawn(accept_rendezvous(inner.clone(), accept.clone()));
        }
        None => tracing::debug!("Ignoring control message without rendezvous on {}", inner.name),
    }
}

async fn accept_rendezvous(inner: Arc<ListenerInner>, accept: AcceptCommand) {
    let dialed = tokio::select! {
        _ = inner.shutdown.cancelled() => return,
        result = tokio_tungstenite::connect_async(accept.address.as_str()) => result,
    };

    let ws = match dialed {
        Ok((ws, _response)) => ws,
        Err(e) => {
            tracing::warn!("Rendezvous {} on {} failed: {}", accept.id, inner.name, e);
            return;
        }
    };

    let conn = Connection::new(WsIo::new(ws), ConnectionInfo::Azure { id: accept.id });
    match inner.queue.push(conn) {
        Ok(()) => tracing::debug!("Rendezvous connection queued on {}", inner.name),
        Err(EnqueueError::Full(conn)) => {
            tracing::warn!("Accept queue full on {}, dropping connection", inner.name);
            conn.close().await;
        }
        Err(EnqueueError::Closed(conn)) => conn.close().await,
    }
}
