//! AzHexGate tunnel client library
//!
//! Creates tunnels through the gateway API and serves them by forwarding
//! relay connections to a local service.

mod api;
mod config;
mod tunnel;

pub use api::{ApiError, GatewayClient};
pub use config::ClientConfig;
pub use tunnel::ClientTunnel;
