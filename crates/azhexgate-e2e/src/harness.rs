//! In-process gateway for E2E tests
//!
//! Starts the gateway HTTP plane on an ephemeral port with either a local
//! (memory) or remote (relay) tunnel manager.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use azhexgate_gateway::{HttpPlane, RemoteSettings, TunnelManager};
use azhexgate_protocol::CreateTunnelRequest;
use azhexgate_relay::forward;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::mock_relay::MockRelay;

/// SAS key name the remote-mode gateway signs with
pub const TEST_KEY_NAME: &str = "RootManageSharedAccessKey";

/// Base64 of a 32-byte test key
pub const TEST_KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A running gateway
pub struct TestGateway {
    pub http_addr: SocketAddr,
    pub base_domain: String,
    pub manager: Arc<TunnelManager>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TestGateway {
    /// Gateway with in-process memory tunnels
    pub async fn start_local() -> Self {
        Self::start(TunnelManager::local(), DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Gateway that issues tunnels on `relay`
    pub async fn start_remote(relay: &MockRelay) -> Self {
        let manager = TunnelManager::remote(RemoteSettings {
            endpoint: relay.endpoint(),
            key_name: TEST_KEY_NAME.to_string(),
            key: TEST_KEY.to_string(),
            token_validity: Duration::from_secs(3600),
        });
        Self::start(manager, DEFAULT_REQUEST_TIMEOUT).await
    }

    pub async fn start(manager: Arc<TunnelManager>, request_timeout: Duration) -> Self {
        let base_domain = "test.example.com".to_string();
        let http_plane = HttpPlane::new(
            manager.clone(),
            base_domain.clone(),
            "http".to_string(),
            request_timeout,
        );

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind HTTP plane");
        let http_addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            if let Err(e) = http_plane.serve(listener).await {
                tracing::error!("HTTP plane error: {}", e);
            }
        });

        Self {
            http_addr,
            base_domain,
            manager,
            shutdown: CancellationToken::new(),
            task,
        }
    }

    /// Base URL of the tunnel API
    pub fn api_url(&self) -> String {
        format!("http://{}", self.http_addr)
    }

    /// Host header value for a tunnel
    pub fn host_for(&self, name: &str) -> String {
        format!("{}.{}", name, self.base_domain)
    }

    /// Local mode: create `name` and serve it in-process by forwarding to `local_addr`
    pub fn expose(&self, name: &str, local_addr: &str) -> String {
        let grant = self
            .manager
            .create_tunnel(&CreateTunnelRequest {
                subdomain: Some(name.to_string()),
                local_port: 0,
            })
            .expect("Failed to create tunnel");
        let listener = self
            .manager
            .take_listener(&grant.name)
            .expect("Local tunnel has no listener");

        tokio::spawn(forward::serve(
            listener,
            local_addr.to_string(),
            self.shutdown.child_token(),
        ));
        grant.name
    }

    /// GET `path` through the tunnel `name`
    pub async fn get(&self, name: &str, path: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(format!("{}{}", self.api_url(), path))
            .header("Host", self.host_for(name))
            .send()
            .await
            .expect("HTTP request failed")
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}
