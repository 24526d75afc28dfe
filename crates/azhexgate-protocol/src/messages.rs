use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How a tunnel's relay leg is carried
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// In-process memory pipes (gateway and client share a process)
    #[default]
    Local,
    /// Azure Relay Hybrid Connections
    Remote,
}

/// Command sent by the relay over a listener's control channel
///
/// Only `accept` is acted upon; other commands the relay may send are
/// deserialized into an empty command and ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenerCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept: Option<AcceptCommand>,
}

/// A sender is waiting; dial `address` to pick up its data connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceptCommand {
    /// Rendezvous WebSocket URL
    #[serde(default)]
    pub address: String,
    /// Relay-assigned connection ID
    #[serde(default)]
    pub id: String,
    /// Headers the sender supplied when connecting
    #[serde(default, rename = "connectHeaders")]
    pub connect_headers: HashMap<String, String>,
}

impl ListenerCommand {
    /// Parse a control-channel text frame
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The accept command, if it names a rendezvous address to dial
    pub fn rendezvous(&self) -> Option<&AcceptCommand> {
        self.accept.as_ref().filter(|a| !a.address.is_empty())
    }
}

/// Request body for `POST /api/tunnels`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    /// Requested tunnel name (None = auto-generate)
    #[serde(default)]
    pub subdomain: Option<String>,
    /// Local port being exposed (informational)
    #[serde(default)]
    pub local_port: u16,
}

/// Response body for `POST /api/tunnels`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelResponse {
    /// Tunnel name, also the public subdomain
    pub name: String,
    /// Public URL that reaches the tunnel
    pub public_url: String,
    /// Transport backing the tunnel
    pub mode: TransportMode,
    /// Relay namespace endpoint (empty in local mode)
    #[serde(default)]
    pub relay_endpoint: String,
    /// Hybrid Connection the client must listen on
    #[serde(default)]
    pub hybrid_connection_name: String,
    /// Token the client presents on its control channel (empty in local mode)
    #[serde(default)]
    pub listener_token: String,
}

/// Error body returned by the gateway API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accept_notification() {
        let json = r#"{"accept":{"address":"wss://relay/rendezvous/abc","id":"conn-1"}}"#;
        let cmd = ListenerCommand::from_json(json).unwrap();

        let accept = cmd.rendezvous().expect("accept command expected");
        assert_eq!(accept.address, "wss://relay/rendezvous/abc");
        assert_eq!(accept.id, "conn-1");
        assert!(accept.connect_headers.is_empty());
    }

    #[test]
    fn test_parse_connect_headers() {
        let json = r#"{"accept":{"address":"wss://r/x","id":"c","connectHeaders":{"X-Trace":"42"}}}"#;
        let cmd = ListenerCommand::from_json(json).unwrap();
        let accept = cmd.rendezvous().unwrap();
        assert_eq!(accept.connect_headers.get("X-Trace").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_empty_address_is_ignored() {
        let json = r#"{"accept":{"address":"","id":"conn-2"}}"#;
        let cmd = ListenerCommand::from_json(json).unwrap();
        assert!(cmd.accept.is_some());
        assert!(cmd.rendezvous().is_none());
    }

    #[test]
    fn test_unknown_command_is_empty() {
        let json = r#"{"request":{"address":"wss://r/y","id":"req-1"}}"#;
        let cmd = ListenerCommand::from_json(json).unwrap();
        assert!(cmd.accept.is_none());
        assert!(cmd.rendezvous().is_none());
    }

    #[test]
    fn test_malformed_notification() {
        assert!(ListenerCommand::from_json("not json").is_err());
    }

    #[test]
    fn test_tunnel_response_serialization() {
        let resp = TunnelResponse {
            name: "myapp".to_string(),
            public_url: "https://myapp.tunnel.example.com".to_string(),
            mode: TransportMode::Remote,
            relay_endpoint: "ns.servicebus.windows.net".to_string(),
            hybrid_connection_name: "myapp".to_string(),
            listener_token: "SharedAccessSignature sr=x".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""mode":"remote""#));

        let parsed: TunnelResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn test_create_request_defaults() {
        let req: CreateTunnelRequest = serde_json::from_str("{}").unwrap();
        assert!(req.subdomain.is_none());
        assert_eq!(req.local_port, 0);
    }
}
