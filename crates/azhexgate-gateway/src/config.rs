//! Gateway configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (AZHEXGATE_*)
//! 2. Config file (gateway.toml)
//! 3. Default values (where applicable)

use std::env;
use std::path::Path;
use std::time::Duration;

use azhexgate_protocol::TransportMode;
use serde::Deserialize;

/// Environment variable prefix
const ENV_PREFIX: &str = "AZHEXGATE";

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TOKEN_VALIDITY_SECS: u64 = 24 * 60 * 60;

/// Gateway configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Port for the HTTP plane (tunnel API and public traffic)
    pub http_port: Option<u16>,

    /// Base domain for tunnels (e.g., "tunnel.example.com")
    pub base_domain: Option<String>,

    /// `local` (in-process memory transport) or `remote` (Azure Relay)
    pub mode: Option<TransportMode>,

    /// Scheme used when building public tunnel URLs
    pub public_scheme: Option<String>,

    /// Seconds to wait for a tunnel to answer a public request
    pub request_timeout_secs: Option<u64>,

    /// Azure Relay settings (remote mode)
    pub relay: Option<RelayConfig>,
}

/// Azure Relay namespace configuration
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay namespace host (e.g., "myns.servicebus.windows.net")
    pub namespace: Option<String>,

    /// Shared access policy name
    pub key_name: Option<String>,

    /// Shared access key (base64)
    pub key: Option<String>,

    /// Lifetime of issued tokens in seconds
    pub token_validity_secs: Option<u64>,
}

/// Resolved gateway configuration
#[derive(Debug, Clone)]
pub struct ResolvedGatewayConfig {
    pub http_port: u16,
    pub base_domain: String,
    pub mode: TransportMode,
    pub public_scheme: String,
    pub request_timeout: Duration,
    /// Present in remote mode
    pub relay: Option<ResolvedRelayConfig>,
}

#[derive(Clone)]
pub struct ResolvedRelayConfig {
    pub namespace: String,
    pub key_name: String,
    pub key: String,
    pub token_validity: Duration,
}

// Keeps the key out of logs
impl std::fmt::Debug for ResolvedRelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedRelayConfig")
            .field("namespace", &self.namespace)
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .field("token_validity", &self.token_validity)
            .finish()
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn parse_mode(value: &str) -> anyhow::Result<TransportMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "local" => Ok(TransportMode::Local),
        "remote" => Ok(TransportMode::Remote),
        other => anyhow::bail!("Invalid mode '{}'. Expected 'local' or 'remote'", other),
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedGatewayConfig> {
        self.resolve_with(get_env)
    }

    /// Resolve with a custom variable lookup (names without the prefix)
    pub fn resolve_with<F>(self, lookup: F) -> anyhow::Result<ResolvedGatewayConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup_u16 = |name: &str| lookup(name).and_then(|v| v.parse::<u16>().ok());
        let lookup_u64 = |name: &str| lookup(name).and_then(|v| v.parse::<u64>().ok());

        // HTTP port: ENV > config > default 8080
        let http_port = lookup_u16("HTTP_PORT")
            .or(self.http_port)
            .unwrap_or(DEFAULT_HTTP_PORT);

        // Base domain: ENV > config > required
        let base_domain = lookup("BASE_DOMAIN")
            .or(self.base_domain)
            .map(|d| d.trim().trim_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Base domain required. Set AZHEXGATE_BASE_DOMAIN or base_domain in config"
                )
            })?;

        // Mode: ENV > config > default local
        let mode = match lookup("MODE") {
            Some(v) => parse_mode(&v)?,
            None => self.mode.unwrap_or_default(),
        };

        let public_scheme = lookup("PUBLIC_SCHEME")
            .or(self.public_scheme)
            .unwrap_or_else(|| "https".to_string());

        let request_timeout = Duration::from_secs(
            lookup_u64("REQUEST_TIMEOUT_SECS")
                .or(self.request_timeout_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        );

        let relay = match mode {
            TransportMode::Local => None,
            TransportMode::Remote => {
                let relay = self.relay.unwrap_or_default();

                let namespace = lookup("RELAY_NAMESPACE").or(relay.namespace).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Relay namespace required in remote mode. Set AZHEXGATE_RELAY_NAMESPACE or relay.namespace in config"
                    )
                })?;
                let key_name = lookup("RELAY_KEY_NAME").or(relay.key_name).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Relay key name required in remote mode. Set AZHEXGATE_RELAY_KEY_NAME or relay.key_name in config"
                    )
                })?;
                let key = lookup("RELAY_KEY").or(relay.key).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Relay key required in remote mode. Set AZHEXGATE_RELAY_KEY or relay.key in config"
                    )
                })?;
                let token_validity = Duration::from_secs(
                    lookup_u64("RELAY_TOKEN_VALIDITY_SECS")
                        .or(relay.token_validity_secs)
                        .unwrap_or(DEFAULT_TOKEN_VALIDITY_SECS),
                );

                Some(ResolvedRelayConfig {
                    namespace,
                    key_name,
                    key,
                    token_validity,
                })
            }
        };

        Ok(ResolvedGatewayConfig {
            http_port,
            base_domain,
            mode,
            public_scheme,
            request_timeout,
            relay,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedGatewayConfig> {
        let config = Self::load(path);
        config.resolve()
    }
}
