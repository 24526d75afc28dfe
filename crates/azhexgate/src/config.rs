//! Client configuration stored at `~/.config/azhexgate/client.toml`
//!
//! Only the gateway address and defaults live here. The local port is always
//! given on the command line.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Gateway base URL (e.g., "https://tunnel.example.com")
    pub gateway_url: Option<String>,

    /// Preferred tunnel name when `--subdomain` is not given
    pub subdomain: Option<String>,

    /// Host the local service listens on
    pub local_host: Option<String>,
}

impl ClientConfig {
    /// Get the default config directory path
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("azhexgate")
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("client.toml")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from the default location, returning None if there is no usable file
    pub fn try_load_default() -> Option<Self> {
        let path = Self::default_path();
        if !path.exists() {
            return None;
        }
        match Self::load(&path) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("Ignoring {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_path() {
        let path = ClientConfig::default_path();
        assert!(path.ends_with("azhexgate/client.toml"));
    }

    #[test]
    fn test_partial_file() {
        let config: ClientConfig = toml::from_str(r#"gateway_url = "http://localhost:8080""#).unwrap();
        assert_eq!(config.gateway_url.as_deref(), Some("http://localhost:8080"));
        assert!(config.subdomain.is_none());
        assert!(config.local_host.is_none());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = ClientConfig {
            gateway_url: Some("https://tunnel.example.com".to_string()),
            subdomain: Some("myapp".to_string()),
            local_host: None,
        };

        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();

        config.save(&path).unwrap();
        assert_eq!(ClientConfig::load(&path).unwrap(), config);
    }
}
