use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use azhexgate_protocol::{CreateTunnelRequest, ErrorResponse, TunnelResponse};
use azhexgate_relay::{forward, Connection, RelayError, RelaySender};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HOST, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::tunnel_manager::{TunnelManager, TunnelManagerError};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

const TUNNELS_PATH: &str = "/api/tunnels";

#[derive(Debug, thiserror::Error)]
enum ProxyError {
    #[error("Failed to reach tunnel: {0}")]
    Dial(#[from] RelayError),

    #[error("Tunnel returned an invalid response: {0}")]
    Upstream(#[from] hyper::Error),
}

/// Gateway HTTP plane
///
/// Requests whose `Host` is a subdomain of the base domain are proxied
/// through that tunnel. Everything else is the tunnel API.
pub struct HttpPlane {
    manager: Arc<TunnelManager>,
    base_domain: String,
    public_scheme: String,
    request_timeout: Duration,
}

impl HttpPlane {
    pub fn new(
        manager: Arc<TunnelManager>,
        base_domain: String,
        public_scheme: String,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            base_domain: base_domain.to_ascii_lowercase(),
            public_scheme,
            request_timeout,
        })
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("HTTP plane listening on {}", addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            tracing::debug!("HTTP connection from {}", peer_addr);
            let _ = stream.set_nodelay(true);

            let this = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let this = this.clone();
                    async move { this.handle_request(req).await }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    tracing::debug!("HTTP connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, Infallible> {
        tracing::debug!(
            "HTTP request: {} {} (Host: {:?})",
            req.method(),
            req.uri(),
            req.headers().get(HOST)
        );

        if let Some(name) = self.extract_subdomain(&req) {
            return Ok(self.proxy(name, req).await);
        }

        let path = req.uri().path().to_string();
        let response = match (req.method(), path.as_str()) {
            (&Method::GET, "/healthz") => text(StatusCode::OK, "ok"),
            (&Method::POST, TUNNELS_PATH) => self.create_tunnel(req).await,
            (&Method::GET, TUNNELS_PATH) => json(StatusCode::OK, &self.manager.list()),
            (&Method::DELETE, p) if p.starts_with("/api/tunnels/") => {
                let name = &p[TUNNELS_PATH.len() + 1..];
                self.delete_tunnel(name).await
            }
            _ => error(StatusCode::NOT_FOUND, "Not found"),
        };
        Ok(response)
    }

    async fn create_tunnel(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Failed to read request body: {}", e);
                return error(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        let request: CreateTunnelRequest = if body.is_empty() {
            CreateTunnelRequest::default()
        } else {
            match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => {
                    return error(
                        StatusCode::BAD_REQUEST,
                        &format!("Invalid tunnel request: {}", e),
                    )
                }
            }
        };

        match self.manager.create_tunnel(&request) {
            Ok(grant) => {
                let response = TunnelResponse {
                    public_url: format!(
                        "{}://{}.{}",
                        self.public_scheme, grant.name, self.base_domain
                    ),
                    hybrid_connection_name: grant.name.clone(),
                    name: grant.name,
                    mode: grant.mode,
                    relay_endpoint: grant.relay_endpoint,
                    listener_token: grant.listener_token,
                };
                json(StatusCode::CREATED, &response)
            }
            Err(e) => {
                let status = match e {
                    TunnelManagerError::InvalidName(_) => StatusCode::BAD_REQUEST,
                    TunnelManagerError::NameTaken(_) => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                tracing::warn!("Tunnel creation rejected: {}", e);
                error(status, &e.to_string())
            }
        }
    }

    async fn delete_tunnel(&self, name: &str) -> Response<ProxyBody> {
        match self.manager.remove_tunnel(name).await {
            Ok(()) => {
                let mut response = Response::new(empty());
                *response.status_mut() = StatusCode::NO_CONTENT;
                response
            }
            Err(e) => error(StatusCode::NOT_FOUND, &e.to_string()),
        }
    }

    /// Forward one public request through the named tunnel
    async fn proxy(&self, name: String, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(sender) = self.manager.sender(&name) else {
            tracing::warn!("No tunnel for subdomain: {}", name);
            return error(
                StatusCode::NOT_FOUND,
                &format!("Tunnel not found for: {}", name),
            );
        };

        tracing::debug!("Forwarding to tunnel: {}", name);
        let abort = CancellationToken::new();

        match tokio::time::timeout(self.request_timeout, forward_request(sender, req, abort.clone()))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                abort.cancel();
                tracing::error!("Tunnel {} failed: {}", name, e);
                error(StatusCode::BAD_GATEWAY, &e.to_string())
            }
            Err(_) => {
                abort.cancel();
                tracing::error!("Timeout waiting for tunnel {}", name);
                error(StatusCode::GATEWAY_TIMEOUT, "Tunnel response timeout")
            }
        }
    }

    /// Extract subdomain from Host header
    fn extract_subdomain<B>(&self, req: &Request<B>) -> Option<String> {
        let host = req.headers().get(HOST)?.to_str().ok()?;

        // Remove port if present
        let host = host.split(':').next()?.to_ascii_lowercase();

        let subdomain_part = host.strip_suffix(&format!(".{}", self.base_domain))?;

        // Only the label directly below the base domain names the tunnel
        let label = subdomain_part.rsplit('.').next()?;
        if label.is_empty() {
            return None;
        }
        Some(label.to_string())
    }
}

/// Send `req` over a fresh tunnel connection and return the response head
///
/// The connection is closed once the response is complete, or when `abort`
/// fires. Upgrade requests are answered with the tunnel's `101` and the two
/// upgraded streams are then joined byte for byte.
async fn forward_request(
    sender: RelaySender,
    mut req: Request<Incoming>,
    abort: CancellationToken,
) -> std::result::Result<Response<ProxyBody>, ProxyError> {
    let conn = sender.dial(&abort).await?;
    let closer = conn.closer();

    let (mut request_sender, connection) =
        hyper::client::conn::http1::handshake(TokioIo::new(conn)).await?;

    let is_upgrade = req.headers().contains_key(UPGRADE);
    if !is_upgrade {
        tokio::spawn(async move {
            tokio::select! {
                result = connection => {
                    if let Err(e) = result {
                        tracing::debug!("Tunnel connection error: {}", e);
                    }
                }
                _ = abort.cancelled() => {}
            }
            closer.close().await;
        });

        let response = request_sender.send_request(req).await?;
        return Ok(response.map(|body| body.boxed()));
    }

    let watch = closer.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = connection.with_upgrades() => {
                if let Err(e) = result {
                    tracing::debug!("Tunnel connection error: {}", e);
                    watch.close().await;
                }
            }
            _ = abort.cancelled() => watch.close().await,
        }
    });

    let downstream = hyper::upgrade::on(&mut req);
    let mut response = request_sender.send_request(req).await?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Ok(response.map(|body| body.boxed()));
    }

    let upstream = hyper::upgrade::on(&mut response);
    tokio::spawn(async move {
        match tokio::try_join!(upstream, downstream) {
            Ok((upstream, downstream)) => {
                let relay = Connection::from_stream(TokioIo::new(upstream));
                let public = Connection::from_stream(TokioIo::new(downstream));
                match forward::join(relay, public).await {
                    Ok(stats) => tracing::debug!(
                        "Upgraded connection finished ({} bytes in, {} bytes out)",
                        stats.relay_to_local,
                        stats.local_to_relay
                    ),
                    Err(e) => tracing::debug!("Upgraded connection failed: {}", e),
                }
            }
            Err(e) => tracing::warn!("Upgrade failed: {}", e),
        }
        closer.close().await;
    });

    let (parts, _) = response.into_parts();
    Ok(Response::from_parts(parts, empty()))
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

fn text(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full(body.to_string()));
    *response.status_mut() = status;
    response
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(full(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
    json(
        status,
        &ErrorResponse {
            error: message.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane() -> Arc<HttpPlane> {
        HttpPlane::new(
            TunnelManager::local(),
            "Tunnel.Example.com".to_string(),
            "https".to_string(),
            Duration::from_secs(30),
        )
    }

    fn with_host(host: &str) -> Request<()> {
        Request::builder()
            .uri("/")
            .header(HOST, host)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_extract_subdomain() {
        let plane = plane();
        assert_eq!(
            plane.extract_subdomain(&with_host("myapp.tunnel.example.com")),
            Some("myapp".to_string())
        );
        assert_eq!(
            plane.extract_subdomain(&with_host("MyApp.Tunnel.Example.com:8080")),
            Some("myapp".to_string())
        );
        assert_eq!(
            plane.extract_subdomain(&with_host("www.myapp.tunnel.example.com")),
            Some("myapp".to_string())
        );
    }

    #[test]
    fn test_no_subdomain() {
        let plane = plane();
        assert_eq!(plane.extract_subdomain(&with_host("tunnel.example.com")), None);
        assert_eq!(plane.extract_subdomain(&with_host("127.0.0.1:8080")), None);
        assert_eq!(plane.extract_subdomain(&with_host("eviltunnel.example.com")), None);

        let no_host = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(plane.extract_subdomain(&no_host), None);
    }

    #[test]
    fn test_error_body_is_json() {
        let response = error(StatusCode::NOT_FOUND, "nope");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
