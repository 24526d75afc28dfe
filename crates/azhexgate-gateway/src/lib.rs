//! AzHexGate gateway library
//!
//! The gateway owns the tunnel registry and the public HTTP plane. It can be
//! embedded in other applications or started in-process for testing.

mod config;
mod http_plane;
mod tunnel_manager;

pub use config::{GatewayConfig, RelayConfig, ResolvedGatewayConfig, ResolvedRelayConfig};
pub use http_plane::HttpPlane;
pub use tunnel_manager::{
    is_valid_tunnel_name, RemoteSettings, TunnelGrant, TunnelInfo, TunnelManager,
    TunnelManagerError,
};
