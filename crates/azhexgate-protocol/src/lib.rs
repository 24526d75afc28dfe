//! Wire protocol shared by the AzHexGate gateway, client and relay transport.
//!
//! Two families of messages live here:
//!
//! - **Relay signaling**: the JSON commands a Hybrid Connections relay sends down a
//!   listener's control channel, plus the path/query/header names used to open
//!   control, rendezvous and sender sockets.
//! - **Tunnel API**: the JSON bodies exchanged between the client and the gateway
//!   when a tunnel is created.

mod messages;

pub use messages::{
    AcceptCommand, CreateTunnelRequest, ErrorResponse, ListenerCommand, TransportMode,
    TunnelResponse,
};

/// Path segment that prefixes every Hybrid Connection endpoint (`/$hc/<name>`)
pub const HC_PATH_PREFIX: &str = "$hc";

/// Query parameter selecting the relay action
pub const ACTION_PARAM: &str = "sb-hc-action";

/// Query parameter carrying the listener instance (or rendezvous) ID
pub const ID_PARAM: &str = "sb-hc-id";

/// Query parameter carrying a shared access signature on sender sockets
pub const TOKEN_PARAM: &str = "sb-hc-token";

/// Header carrying the listener's token on the control channel
pub const AUTH_HEADER: &str = "ServiceBusAuthorization";

/// Relay actions understood by the `sb-hc-action` parameter
pub mod action {
    /// Listener control channel
    pub const LISTEN: &str = "listen";
    /// Sender data socket
    pub const CONNECT: &str = "connect";
    /// Listener rendezvous socket
    pub const ACCEPT: &str = "accept";
}
