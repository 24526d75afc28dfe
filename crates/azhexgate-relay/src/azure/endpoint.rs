use std::fmt;

use azhexgate_protocol::{action, ACTION_PARAM, HC_PATH_PREFIX, ID_PARAM, TOKEN_PARAM};
use url::Url;

use crate::error::RelayError;

/// Relay namespace address
///
/// Accepts a bare host (`ns.servicebus.windows.net`), an `sb://`, `https://`
/// or `wss://` URL (all mapped to `wss`) or a `ws://`/`http://` URL for relays
/// without TLS. Any path on the input is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    secure: bool,
    authority: String,
}

impl RelayEndpoint {
    pub fn parse(endpoint: &str) -> Result<Self, RelayError> {
        let trimmed = endpoint.trim();
        if trimmed.is_empty() {
            return Err(RelayError::invalid_endpoint(endpoint, "empty endpoint"));
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("wss".to_string(), trimmed),
        };
        let secure = match scheme.as_str() {
            "sb" | "https" | "wss" => true,
            "ws" | "http" => false,
            other => {
                return Err(RelayError::invalid_endpoint(
                    endpoint,
                    format!("unsupported scheme '{}'", other),
                ))
            }
        };

        // Let the URL parser validate host and port
        let scheme = if secure { "wss" } else { "ws" };
        let url = Url::parse(&format!("{}://{}", scheme, rest))
            .map_err(|e| RelayError::invalid_endpoint(endpoint, e.to_string()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RelayError::invalid_endpoint(endpoint, "missing host"))?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self { secure, authority })
    }

    /// `host[:port]`
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Resource URI a SAS token for `name` is scoped to
    pub fn resource_uri(&self, name: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}/{}", scheme, self.authority, name)
    }

    /// Control-channel URL for a listener instance
    pub fn listen_url(&self, name: &str, listener_id: &str) -> Result<Url, RelayError> {
        let mut url = self.hc_url(name)?;
        url.query_pairs_mut()
            .append_pair(ACTION_PARAM, action::LISTEN)
            .append_pair(ID_PARAM, listener_id);
        Ok(url)
    }

    /// Sender URL, with the token in the query when it is a SAS token
    pub fn connect_url(&self, name: &str, token: Option<&str>) -> Result<Url, RelayError> {
        let mut url = self.hc_url(name)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(ACTION_PARAM, action::CONNECT);
            if let Some(token) = token {
                query.append_pair(TOKEN_PARAM, token);
            }
        }
        Ok(url)
    }

    fn hc_url(&self, name: &str) -> Result<Url, RelayError> {
        if name.is_empty() {
            return Err(RelayError::invalid_endpoint(
                self.to_string(),
                "empty hybrid connection name",
            ));
        }
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{}://{}/", scheme, self.authority))
            .map_err(|e| RelayError::invalid_endpoint(self.to_string(), e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| RelayError::invalid_endpoint(self.to_string(), "cannot carry a path"))?
            .clear()
            .push(HC_PATH_PREFIX)
            .push(name);
        Ok(url)
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "wss" } else { "ws" };
        write!(f, "{}://{}", scheme, self.authority)
    }
}
