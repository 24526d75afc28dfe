//! In-process Hybrid Connections relay for E2E tests
//!
//! Speaks enough of the relay protocol for the Azure transport:
//! - `sb-hc-action=listen` registers a control channel for the named connection
//! - `sb-hc-action=connect` sends an accept notification down a control channel
//!   and waits for the listener to dial back
//! - `sb-hc-action=accept` is the listener's rendezvous dial; the two sockets are
//!   then paired message for message
//!
//! Connect requests for names with no live listener are rejected with 404.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use azhexgate_protocol::{action, AUTH_HEADER, ACTION_PARAM, HC_PATH_PREFIX, ID_PARAM, TOKEN_PARAM};
use azhexgate_relay::RelayEndpoint;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

type RelaySocket = WebSocketStream<TcpStream>;

/// How long a sender waits for the listener's rendezvous dial
const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(10);

/// One WebSocket handshake seen by the relay
#[derive(Clone, Debug, Default)]
pub struct RecordedHandshake {
    /// `listen`, `connect` or `accept`
    pub action: String,
    /// Hybrid Connection name from the path
    pub name: String,
    /// `sb-hc-id` query parameter
    pub id: Option<String>,
    /// `sb-hc-token` query parameter
    pub query_token: Option<String>,
    /// `ServiceBusAuthorization` header
    pub service_bus_auth: Option<String>,
    /// `Authorization` header
    pub authorization: Option<String>,
}

impl RecordedHandshake {
    fn from_request(req: &Request) -> Option<Self> {
        let url = Url::parse(&format!("ws://relay{}", req.uri())).ok()?;
        let mut segments = url.path_segments()?;
        if segments.next()? != HC_PATH_PREFIX {
            return None;
        }
        let name = segments.next()?.to_string();

        let mut handshake = RecordedHandshake {
            name,
            ..Default::default()
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                ACTION_PARAM => handshake.action = value.into_owned(),
                ID_PARAM => handshake.id = Some(value.into_owned()),
                TOKEN_PARAM => handshake.query_token = Some(value.into_owned()),
                _ => {}
            }
        }

        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        handshake.service_bus_auth = header(AUTH_HEADER);
        handshake.authorization = header(AUTHORIZATION.as_str());
        Some(handshake)
    }
}

#[derive(Default)]
struct RelayState {
    /// Control channels per connection name; each entry feeds one control socket
    listeners: HashMap<String, Vec<mpsc::UnboundedSender<Message>>>,
    /// Senders waiting for their rendezvous, by connection ID
    rendezvous: HashMap<String, oneshot::Sender<RelaySocket>>,
    handshakes: Vec<RecordedHandshake>,
}

impl RelayState {
    fn live_listener(&mut self, name: &str) -> Option<mpsc::UnboundedSender<Message>> {
        let channels = self.listeners.get_mut(name)?;
        channels.retain(|tx| !tx.is_closed());
        channels.last().cloned()
    }
}

/// A running mock relay
pub struct MockRelay {
    addr: SocketAddr,
    state: Arc<Mutex<RelayState>>,
    task: JoinHandle<()>,
}

impl MockRelay {
    /// Start the relay on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock relay");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(RelayState::default()));

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("Mock relay accept error: {}", e);
                        break;
                    }
                };
                let _ = stream.set_nodelay(true);
                tokio::spawn(handle_socket(stream, addr, accept_state.clone()));
            }
        });

        Self { addr, state, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint the Azure transport should use (`ws://127.0.0.1:<port>`)
    pub fn endpoint(&self) -> RelayEndpoint {
        RelayEndpoint::parse(&format!("ws://{}", self.addr)).unwrap()
    }

    /// Every handshake seen so far, in arrival order
    pub fn handshakes(&self) -> Vec<RecordedHandshake> {
        self.state.lock().handshakes.clone()
    }

    /// Handshakes for one action (`listen`, `connect`, `accept`)
    pub fn handshakes_for(&self, action: &str) -> Vec<RecordedHandshake> {
        self.handshakes()
            .into_iter()
            .filter(|h| h.action == action)
            .collect()
    }

    pub fn has_listener(&self, name: &str) -> bool {
        self.state.lock().live_listener(name).is_some()
    }

    /// Wait until a control channel for `name` is registered
    pub async fn wait_for_listener(&self, name: &str) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if self.has_listener(name) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Push a raw text frame down every control channel for `name`
    pub fn send_control_text(&self, name: &str, text: &str) {
        if let Some(channels) = self.state.lock().listeners.get(name) {
            for tx in channels {
                let _ = tx.send(Message::Text(text.to_string()));
            }
        }
    }

    /// Close every control channel for `name`, as if the relay dropped it
    pub fn drop_listeners(&self, name: &str) {
        if let Some(channels) = self.state.lock().listeners.remove(name) {
            for tx in channels {
                let _ = tx.send(Message::Close(None));
            }
        }
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_socket(stream: TcpStream, relay_addr: SocketAddr, state: Arc<Mutex<RelayState>>) {
    let mut seen: Option<RecordedHandshake> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let handshake = RecordedHandshake::from_request(req);
        let mut state = state.lock();
        if let Some(h) = &handshake {
            state.handshakes.push(h.clone());
        }

        let rejection = match &handshake {
            None => Some((StatusCode::BAD_REQUEST, "not a hybrid connection path")),
            Some(h) if h.action == action::CONNECT && state.live_listener(&h.name).is_none() => {
                Some((StatusCode::NOT_FOUND, "no listener connected"))
            }
            Some(_) => None,
        };
        seen = handshake;

        match rejection {
            Some((status, reason)) => {
                let mut error = ErrorResponse::new(Some(reason.to_string()));
                *error.status_mut() = status;
                Err(error)
            }
            None => Ok(resp),
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!("Mock relay handshake rejected: {}", e);
            return;
        }
    };
    let Some(handshake) = seen else {
        return;
    };

    match handshake.action.as_str() {
        action::LISTEN => {
            let (tx, rx) = mpsc::unbounded_channel();
            state
                .lock()
                .listeners
                .entry(handshake.name.clone())
                .or_default()
                .push(tx);
            tracing::debug!("Mock relay: listener registered for {}", handshake.name);
            run_control(ws, rx).await;
        }
        action::CONNECT => {
            connect_sender(ws, &handshake.name, relay_addr, &state).await;
        }
        action::ACCEPT => {
            let waiting = handshake
                .id
                .as_deref()
                .and_then(|id| state.lock().rendezvous.remove(id));
            match waiting {
                Some(tx) => {
                    let _ = tx.send(ws);
                }
                None => tracing::warn!("Mock relay: rendezvous for unknown id {:?}", handshake.id),
            }
        }
        other => tracing::warn!("Mock relay: unknown action '{}'", other),
    }
}

/// Relay notifications to a listener until either side closes
async fn run_control(ws: RelaySocket, mut outgoing: mpsc::UnboundedReceiver<Message>) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            msg = outgoing.recv() => match msg {
                Some(Message::Close(frame)) => {
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
                Some(msg) => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn connect_sender(
    sender: RelaySocket,
    name: &str,
    relay_addr: SocketAddr,
    state: &Arc<Mutex<RelayState>>,
) {
    let id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();

    let control = {
        let mut state = state.lock();
        state.rendezvous.insert(id.clone(), tx);
        state.live_listener(name)
    };
    let Some(control) = control else {
        state.lock().rendezvous.remove(&id);
        close_socket(sender).await;
        return;
    };

    let address = format!(
        "ws://{}/{}/{}?{}={}&{}={}",
        relay_addr,
        HC_PATH_PREFIX,
        name,
        ACTION_PARAM,
        action::ACCEPT,
        ID_PARAM,
        id
    );
    let notification = format!(
        r#"{{"accept":{{"address":"{}","id":"{}","connectHeaders":{{}}}}}}"#,
        address, id
    );
    let _ = control.send(Message::Text(notification));

    match tokio::time::timeout(RENDEZVOUS_TIMEOUT, rx).await {
        Ok(Ok(listener)) => {
            tracing::debug!("Mock relay: paired connection {} on {}", id, name);
            pair(sender, listener).await;
        }
        _ => {
            tracing::warn!("Mock relay: no rendezvous for {} on {}", id, name);
            state.lock().rendezvous.remove(&id);
            close_socket(sender).await;
        }
    }
}

async fn close_socket(mut ws: RelaySocket) {
    let _ = ws.close(None).await;
}

/// Shuttle messages between two sockets; a close on one side closes the other
async fn pair(a: RelaySocket, b: RelaySocket) {
    let (mut a_sink, mut a_stream) = a.split();
    let (mut b_sink, mut b_stream) = b.split();

    tokio::select! {
        _ = pump(&mut a_stream, &mut b_sink) => {}
        _ = pump(&mut b_stream, &mut a_sink) => {}
    }

    let _ = a_sink.send(Message::Close(None)).await;
    let _ = b_sink.send(Message::Close(None)).await;
}

async fn pump(
    from: &mut SplitStream<RelaySocket>,
    to: &mut SplitSink<RelaySocket, Message>,
) {
    while let Some(Ok(msg)) = from.next().await {
        match msg {
            Message::Binary(_) | Message::Text(_) => {
                if to.send(msg).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}
