use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use azhexgate_protocol::{CreateTunnelRequest, TransportMode};
use azhexgate_relay::sas::generate_sas_token;
use azhexgate_relay::{
    AzureSender, MemoryListener, RelayEndpoint, RelayError, RelayListener, RelaySender,
};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::config::ResolvedGatewayConfig;

/// How many random names to try before giving up
const NAME_ATTEMPTS: usize = 8;

/// Azure Relay namespace the gateway issues tokens for
#[derive(Clone)]
pub struct RemoteSettings {
    pub endpoint: RelayEndpoint,
    pub key_name: String,
    pub key: String,
    pub token_validity: Duration,
}

enum ManagerMode {
    Local,
    Remote(RemoteSettings),
}

/// What a client needs to serve a freshly created tunnel
#[derive(Debug, Clone)]
pub struct TunnelGrant {
    pub name: String,
    pub mode: TransportMode,
    /// Relay namespace endpoint (empty in local mode)
    pub relay_endpoint: String,
    /// Token for the client's control channel (empty in local mode)
    pub listener_token: String,
}

/// Summary of a registered tunnel
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TunnelInfo {
    pub name: String,
    pub local_port: u16,
    pub mode: TransportMode,
}

struct TunnelEntry {
    sender: RelaySender,
    /// Gateway-side listener (local mode only)
    listener: Option<RelayListener>,
    listener_taken: bool,
    local_port: u16,
}

/// Registry of tunnels keyed by name
///
/// Local mode pairs each tunnel with an in-process memory listener. Remote
/// mode signs relay tokens so the client can listen on the Hybrid Connection
/// of the same name while the gateway dials it.
pub struct TunnelManager {
    mode: ManagerMode,
    tunnels: RwLock<HashMap<String, TunnelEntry>>,
}

impl TunnelManager {
    pub fn local() -> Arc<Self> {
        Arc::new(Self {
            mode: ManagerMode::Local,
            tunnels: RwLock::new(HashMap::new()),
        })
    }

    pub fn remote(settings: RemoteSettings) -> Arc<Self> {
        Arc::new(Self {
            mode: ManagerMode::Remote(settings),
            tunnels: RwLock::new(HashMap::new()),
        })
    }

    /// Build the manager a resolved configuration asks for
    pub fn from_config(config: &ResolvedGatewayConfig) -> Result<Arc<Self>, TunnelManagerError> {
        match (&config.mode, &config.relay) {
            (TransportMode::Local, _) => Ok(Self::local()),
            (TransportMode::Remote, Some(relay)) => Ok(Self::remote(RemoteSettings {
                endpoint: RelayEndpoint::parse(&relay.namespace)?,
                key_name: relay.key_name.clone(),
                key: relay.key.clone(),
                token_validity: relay.token_validity,
            })),
            (TransportMode::Remote, None) => Err(TunnelManagerError::Relay(
                RelayError::invalid_endpoint("", "remote mode without relay settings"),
            )),
        }
    }

    pub fn mode(&self) -> TransportMode {
        match self.mode {
            ManagerMode::Local => TransportMode::Local,
            ManagerMode::Remote(_) => TransportMode::Remote,
        }
    }

    /// Register a tunnel under the requested name, or a generated one
    pub fn create_tunnel(
        &self,
        request: &CreateTunnelRequest,
    ) -> Result<TunnelGrant, TunnelManagerError> {
        let mut tunnels = self.tunnels.write();

        let name = match &request.subdomain {
            Some(requested) => {
                let name = requested.trim().to_ascii_lowercase();
                if !is_valid_tunnel_name(&name) {
                    return Err(TunnelManagerError::InvalidName(requested.clone()));
                }
                if tunnels.contains_key(&name) {
                    return Err(TunnelManagerError::NameTaken(name));
                }
                name
            }
            None => (0..NAME_ATTEMPTS)
                .map(|_| generate_tunnel_name())
                .find(|name| !tunnels.contains_key(name))
                .ok_or(TunnelManagerError::NameExhausted)?,
        };

        let (entry, grant) = match &self.mode {
            ManagerMode::Local => {
                let listener = MemoryListener::new(name.clone());
                let entry = TunnelEntry {
                    sender: listener.sender().into(),
                    listener: Some(listener.into()),
                    listener_taken: false,
                    local_port: request.local_port,
                };
                let grant = TunnelGrant {
                    name: name.clone(),
                    mode: TransportMode::Local,
                    relay_endpoint: String::new(),
                    listener_token: String::new(),
                };
                (entry, grant)
            }
            ManagerMode::Remote(settings) => {
                let resource = settings.endpoint.resource_uri(&name);
                let listener_token = generate_sas_token(
                    &resource,
                    &settings.key_name,
                    &settings.key,
                    settings.token_validity,
                )?;
                let sender_token = generate_sas_token(
                    &resource,
                    &settings.key_name,
                    &settings.key,
                    settings.token_validity,
                )?;

                let sender =
                    AzureSender::new(settings.endpoint.clone(), name.clone(), Some(sender_token));
                let entry = TunnelEntry {
                    sender: sender.into(),
                    listener: None,
                    listener_taken: false,
                    local_port: request.local_port,
                };
                let grant = TunnelGrant {
                    name: name.clone(),
                    mode: TransportMode::Remote,
                    relay_endpoint: settings.endpoint.to_string(),
                    listener_token,
                };
                (entry, grant)
            }
        };

        tunnels.insert(name.clone(), entry);
        tracing::info!(
            "Tunnel {} created ({:?}, local port {})",
            name,
            grant.mode,
            request.local_port
        );
        Ok(grant)
    }

    /// Sender for the named tunnel
    pub fn sender(&self, name: &str) -> Option<RelaySender> {
        self.tunnels.read().get(name).map(|t| t.sender.clone())
    }

    /// Hand the local-mode listener to an in-process client (once)
    pub fn take_listener(&self, name: &str) -> Option<RelayListener> {
        let mut tunnels = self.tunnels.write();
        let entry = tunnels.get_mut(name)?;
        if entry.listener_taken {
            return None;
        }
        let listener = entry.listener.clone()?;
        entry.listener_taken = true;
        Some(listener)
    }

    /// Unregister a tunnel and close its sender and listener
    pub async fn remove_tunnel(&self, name: &str) -> Result<(), TunnelManagerError> {
        let entry = self
            .tunnels
            .write()
            .remove(name)
            .ok_or_else(|| TunnelManagerError::NotFound(name.to_string()))?;

        entry.sender.close();
        if let Some(listener) = entry.listener {
            listener.close().await;
        }
        tracing::info!("Tunnel {} removed", name);
        Ok(())
    }

    /// Remove every tunnel
    pub async fn shutdown(&self) {
        let entries: Vec<(String, TunnelEntry)> = self.tunnels.write().drain().collect();
        for (name, entry) in entries {
            entry.sender.close();
            if let Some(listener) = entry.listener {
                listener.close().await;
            }
            tracing::debug!("Tunnel {} closed on shutdown", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tunnels.read().contains_key(name)
    }

    /// Registered tunnels, sorted by name
    pub fn list(&self) -> Vec<TunnelInfo> {
        let mode = self.mode();
        let mut list: Vec<TunnelInfo> = self
            .tunnels
            .read()
            .iter()
            .map(|(name, entry)| TunnelInfo {
                name: name.clone(),
                local_port: entry.local_port,
                mode,
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

/// Tunnel names are DNS labels: 1-63 chars, alphanumeric or `-`, alphanumeric at both ends
pub fn is_valid_tunnel_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }

    let bytes = name.as_bytes();
    let alnum_ends = bytes[0].is_ascii_alphanumeric() && bytes[bytes.len() - 1].is_ascii_alphanumeric();
    alnum_ends && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

/// Random eight-character name starting with a letter
fn generate_tunnel_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    let (first, rest) = id.split_at(1);
    let prefix = match first.as_bytes()[0] {
        // Map 0-9 to a-j
        d @ b'0'..=b'9' => char::from(b'a' + (d - b'0')),
        c => char::from(c),
    };
    format!("{}{}", prefix, &rest[..7])
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelManagerError {
    #[error("Invalid tunnel name: {0}")]
    InvalidName(String),

    #[error("Tunnel name already taken: {0}")]
    NameTaken(String),

    #[error("Could not generate a free tunnel name")]
    NameExhausted,

    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

#[cfg(test)]
mod tests {
    use azhexgate_relay::TransportKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn request(subdomain: Option<&str>) -> CreateTunnelRequest {
        CreateTunnelRequest {
            subdomain: subdomain.map(str::to_string),
            local_port: 3000,
        }
    }

    fn remote_manager() -> Arc<TunnelManager> {
        TunnelManager::remote(RemoteSettings {
            endpoint: RelayEndpoint::parse("myns.servicebus.windows.net").unwrap(),
            key_name: "RootManageSharedAccessKey".to_string(),
            key: "c2VjcmV0LWtleQ==".to_string(),
            token_validity: Duration::from_secs(3600),
        })
    }

    #[test]
    fn test_valid_tunnel_names() {
        assert!(is_valid_tunnel_name("myapp"));
        assert!(is_valid_tunnel_name("my-app"));
        assert!(is_valid_tunnel_name("my-app-123"));
        assert!(is_valid_tunnel_name("a"));
        assert!(is_valid_tunnel_name("123"));
        assert!(is_valid_tunnel_name(&"a".repeat(63)));
    }

    #[test]
    fn test_invalid_tunnel_names() {
        assert!(!is_valid_tunnel_name(""));
        assert!(!is_valid_tunnel_name("-myapp"));
        assert!(!is_valid_tunnel_name("myapp-"));
        assert!(!is_valid_tunnel_name("my_app"));
        assert!(!is_valid_tunnel_name("my.app"));
        assert!(!is_valid_tunnel_name("café"));
        assert!(!is_valid_tunnel_name(&"a".repeat(64)));
    }

    #[test]
    fn test_generated_names_are_valid() {
        for _ in 0..100 {
            let name = generate_tunnel_name();
            assert_eq!(name.len(), 8);
            assert!(name.as_bytes()[0].is_ascii_lowercase());
            assert!(is_valid_tunnel_name(&name));
        }
    }

    #[test]
    fn test_duplicate_and_invalid_requests() {
        let manager = TunnelManager::local();
        manager.create_tunnel(&request(Some("myapp"))).unwrap();

        assert!(matches!(
            manager.create_tunnel(&request(Some("MyApp"))),
            Err(TunnelManagerError::NameTaken(_))
        ));
        assert!(matches!(
            manager.create_tunnel(&request(Some("bad_name"))),
            Err(TunnelManagerError::InvalidName(_))
        ));
    }

    #[test]
    fn test_generated_name_when_none_requested() {
        let manager = TunnelManager::local();
        let grant = manager.create_tunnel(&request(None)).unwrap();
        assert!(manager.contains(&grant.name));
        assert_eq!(grant.mode, TransportMode::Local);
        assert!(grant.listener_token.is_empty());
    }

    #[tokio::test]
    async fn test_local_tunnel_sender_reaches_taken_listener() {
        let manager = TunnelManager::local();
        manager.create_tunnel(&request(Some("hc-1"))).unwrap();

        let listener = manager.take_listener("hc-1").unwrap();
        assert!(manager.take_listener("hc-1").is_none());
        let sender = manager.sender("hc-1").unwrap();
        assert_eq!(sender.kind(), TransportKind::Memory);

        let cancel = CancellationToken::new();
        let mut dialed = sender.dial(&cancel).await.unwrap();
        let mut accepted = listener.accept(&cancel).await.unwrap();
        dialed.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_remove_closes_listener_and_sender() {
        let manager = TunnelManager::local();
        manager.create_tunnel(&request(Some("gone"))).unwrap();
        let listener = manager.take_listener("gone").unwrap();
        let sender = manager.sender("gone").unwrap();

        manager.remove_tunnel("gone").await.unwrap();
        assert!(listener.is_closed());
        assert!(sender.is_closed());
        assert!(manager.sender("gone").is_none());
        assert!(matches!(
            manager.remove_tunnel("gone").await,
            Err(TunnelManagerError::NotFound(_))
        ));
    }

    #[test]
    fn test_remote_grant_carries_signed_token() {
        let manager = remote_manager();
        let grant = manager.create_tunnel(&request(Some("myapp"))).unwrap();

        assert_eq!(grant.mode, TransportMode::Remote);
        assert_eq!(grant.relay_endpoint, "wss://myns.servicebus.windows.net");
        assert!(grant.listener_token.starts_with(
            "SharedAccessSignature sr=https%3A%2F%2Fmyns.servicebus.windows.net%2Fmyapp&sig="
        ));
        assert!(grant.listener_token.ends_with("&skn=RootManageSharedAccessKey"));

        assert_eq!(manager.sender("myapp").unwrap().kind(), TransportKind::Azure);
        assert!(manager.take_listener("myapp").is_none());
    }

    #[test]
    fn test_remote_bad_key_fails_without_registering() {
        let manager = TunnelManager::remote(RemoteSettings {
            endpoint: RelayEndpoint::parse("myns.servicebus.windows.net").unwrap(),
            key_name: "k".to_string(),
            key: "***".to_string(),
            token_validity: Duration::from_secs(60),
        });
        assert!(matches!(
            manager.create_tunnel(&request(Some("myapp"))),
            Err(TunnelManagerError::Relay(RelayError::InvalidKey(_)))
        ));
        assert!(!manager.contains("myapp"));
    }

    #[tokio::test]
    async fn test_list_and_shutdown() {
        let manager = TunnelManager::local();
        manager.create_tunnel(&request(Some("b"))).unwrap();
        manager.create_tunnel(&request(Some("a"))).unwrap();

        let names: Vec<String> = manager.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        manager.shutdown().await;
        assert!(manager.list().is_empty());
    }
}
