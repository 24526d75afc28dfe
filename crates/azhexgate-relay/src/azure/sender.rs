use std::sync::Arc;

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;

use super::endpoint::RelayEndpoint;
use super::ws_io::WsIo;
use crate::connection::{Connection, ConnectionInfo};
use crate::error::RelayError;
use crate::sas::is_shared_access_signature;

struct SenderInner {
    endpoint: RelayEndpoint,
    name: String,
    token: Option<String>,
    closed: CancellationToken,
}

/// Hybrid Connection sender; every dial opens one WebSocket to the relay
#[derive(Clone)]
pub struct AzureSender {
    inner: Arc<SenderInner>,
}

impl AzureSender {
    pub fn new(endpoint: RelayEndpoint, name: impl Into<String>, token: Option<String>) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                endpoint,
                name: name.into(),
                token: token.filter(|t| !t.is_empty()),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.inner.endpoint
    }

    pub async fn dial(&self, cancel: &CancellationToken) -> Result<Connection, RelayError> {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        if self.inner.closed.is_cancelled() {
            return Err(RelayError::SenderClosed);
        }

        // SAS tokens travel in the query string, anything else as a bearer token
        let token = self.inner.token.as_deref();
        let (query_token, bearer) = match token {
            Some(t) if is_shared_access_signature(t) => (Some(t), None),
            Some(t) => (None, Some(t)),
            None => (None, None),
        };

        let url = self.inner.endpoint.connect_url(&self.inner.name, query_token)?;
        let mut request = url.as_str().into_client_request()?;
        if let Some(bearer) = bearer {
            let value = HeaderValue::from_str(&format!("Bearer {}", bearer))
                .map_err(|e| RelayError::Protocol(format!("invalid sender token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _response) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            _ = self.inner.closed.cancelled() => return Err(RelayError::SenderClosed),
            result = tokio_tungstenite::connect_async(request) => result?,
        };

        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!("Sender connection {} opened on {}", id, self.inner.name);
        Ok(Connection::new(WsIo::new(ws), ConnectionInfo::Azure { id }))
    }

    /// Later dials fail with `SenderClosed`; idempotent
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::Message;

    use super::*;

    #[derive(Debug, Default, Clone)]
    struct Seen {
        uri: String,
        authorization: Option<String>,
    }

    /// Accepts one sender socket, records the handshake and echoes messages
    async fn echo_relay() -> (RelayEndpoint, Arc<Mutex<Seen>>) {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Seen::default()));

        let record = seen.clone();
        tokio::spawn(async move {
            let (stream, _) = tcp.accept().await.unwrap();
            let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let mut seen = record.lock();
                seen.uri = req.uri().to_string();
                seen.authorization = req
                    .headers()
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
                if msg.is_binary() && ws.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let endpoint = RelayEndpoint::parse(&format!("ws://{}", addr)).unwrap();
        (endpoint, seen)
    }

    #[tokio::test]
    async fn test_sas_token_goes_in_query() {
        let (endpoint, seen) = echo_relay().await;
        let sender = AzureSender::new(
            endpoint,
            "hc-1",
            Some("SharedAccessSignature sr=a&sig=b&se=1&skn=k".to_string()),
        );

        let mut conn = sender.dial(&CancellationToken::new()).await.unwrap();
        assert!(matches!(conn.info(), ConnectionInfo::Azure { .. }));

        conn.write_all(b"ping").await.unwrap();
        conn.flush().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let seen = seen.lock().clone();
        assert!(seen.uri.starts_with("/$hc/hc-1?sb-hc-action=connect&sb-hc-token="));
        assert!(seen.authorization.is_none());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_other_token_goes_in_bearer_header() {
        let (endpoint, seen) = echo_relay().await;
        let sender = AzureSender::new(endpoint, "hc-1", Some("eyJ0eXAi".to_string()));

        let conn = sender.dial(&CancellationToken::new()).await.unwrap();
        let seen = seen.lock().clone();
        assert_eq!(seen.uri, "/$hc/hc-1?sb-hc-action=connect");
        assert_eq!(seen.authorization.as_deref(), Some("Bearer eyJ0eXAi"));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_dial_after_close_and_cancel() {
        let endpoint = RelayEndpoint::parse("ws://127.0.0.1:1").unwrap();
        let sender = AzureSender::new(endpoint, "hc-1", None);

        let expired = CancellationToken::new();
        expired.cancel();
        assert!(matches!(
            sender.dial(&expired).await,
            Err(RelayError::Cancelled)
        ));

        sender.close();
        sender.close();
        assert!(sender.is_closed());
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(1), sender.dial(&CancellationToken::new()))
                .await
                .unwrap(),
            Err(RelayError::SenderClosed)
        ));
    }
}
