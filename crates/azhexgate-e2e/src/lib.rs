//! End-to-end test utilities for AzHexGate
//!
//! Runs the gateway, a Hybrid Connections stand-in and mock local services
//! in-process, so tunnels can be exercised without an Azure namespace.

pub mod harness;
pub mod mock_relay;
pub mod mock_service;
pub mod mock_tcp_service;

pub use harness::{TestGateway, TEST_KEY, TEST_KEY_NAME};
pub use mock_relay::{MockRelay, RecordedHandshake};
pub use mock_service::{MockHttpService, RecordedRequest};
pub use mock_tcp_service::{MockTcpService, TcpServiceMode};

/// Install the rustls provider and test logging (both idempotent)
pub fn init_test() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("azhexgate=debug,azhexgate_relay=debug,azhexgate_gateway=debug,azhexgate_e2e=debug")
        .with_test_writer()
        .try_init();
}
