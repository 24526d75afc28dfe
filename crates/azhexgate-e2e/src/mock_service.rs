//! Mock HTTP service standing in for the local service behind a tunnel
//!
//! Records every request and answers with a configurable status, body and
//! optional delay (for gateway timeout tests).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A request as the local service saw it
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

struct ServiceState {
    requests: RwLock<Vec<RecordedRequest>>,
    status: RwLock<StatusCode>,
    body: RwLock<Vec<u8>>,
    headers: RwLock<Vec<(String, String)>>,
    delay: RwLock<Option<Duration>>,
}

impl ServiceState {
    async fn respond(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let headers = req
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = req
            .into_body()
            .collect()
            .await
            .map(|b| b.to_bytes().to_vec())
            .unwrap_or_default();

        self.requests.write().push(RecordedRequest {
            method,
            uri,
            headers,
            body,
        });

        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut builder = Response::builder().status(*self.status.read());
        for (name, value) in self.headers.read().iter() {
            builder = builder.header(name, value);
        }
        builder
            .body(Full::new(Bytes::from(self.body.read().clone())))
            .unwrap()
    }
}

/// A mock HTTP service on an ephemeral port
pub struct MockHttpService {
    addr: SocketAddr,
    state: Arc<ServiceState>,
    task: JoinHandle<()>,
}

impl MockHttpService {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(ServiceState {
            requests: RwLock::new(Vec::new()),
            status: RwLock::new(StatusCode::OK),
            body: RwLock::new(b"OK".to_vec()),
            headers: RwLock::new(Vec::new()),
            delay: RwLock::new(None),
        });

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(state.respond(req).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address as "127.0.0.1:<port>"
    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn get_requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.read().clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.requests.read().last().cloned()
    }

    pub fn set_response_status(&self, status: StatusCode) {
        *self.state.status.write() = status;
    }

    pub fn set_response_body(&self, body: impl Into<Vec<u8>>) {
        *self.state.body.write() = body.into();
    }

    pub fn add_response_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state.headers.write().push((name.into(), value.into()));
    }

    /// Hold every response for `delay` before answering
    pub fn set_response_delay(&self, delay: Duration) {
        *self.state.delay.write() = Some(delay);
    }
}

impl Drop for MockHttpService {
    fn drop(&mut self) {
        self.task.abort();
    }
}
