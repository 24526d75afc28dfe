use azhexgate_protocol::{TransportMode, TunnelResponse};
use azhexgate_relay::{forward, AzureListener, RelayEndpoint, RelayError, RelayListener};
use tokio_util::sync::CancellationToken;

/// The client side of one tunnel: a listener plus where it is reachable
pub struct ClientTunnel {
    name: String,
    public_url: String,
    listener: RelayListener,
}

impl ClientTunnel {
    /// Build the relay listener a remote-mode grant describes
    pub fn from_response(response: &TunnelResponse) -> Result<Self, RelayError> {
        if response.mode != TransportMode::Remote {
            return Err(RelayError::Protocol(
                "gateway runs in local mode; tunnels are served inside the gateway".to_string(),
            ));
        }

        let endpoint = RelayEndpoint::parse(&response.relay_endpoint)?;
        let listener = AzureListener::new(
            endpoint,
            response.hybrid_connection_name.clone(),
            Some(response.listener_token.clone()),
        );

        Ok(Self {
            name: response.name.clone(),
            public_url: response.public_url.clone(),
            listener: listener.into(),
        })
    }

    /// Wrap an existing listener (e.g. one handed out in-process)
    pub fn from_listener(
        name: impl Into<String>,
        public_url: impl Into<String>,
        listener: RelayListener,
    ) -> Self {
        Self {
            name: name.into(),
            public_url: public_url.into(),
            listener,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn listener(&self) -> &RelayListener {
        &self.listener
    }

    /// Forward every connection to `local_addr` until cancelled or the listener dies
    pub async fn run(&self, local_addr: &str, cancel: CancellationToken) -> Result<(), RelayError> {
        forward::serve(self.listener.clone(), local_addr.to_string(), cancel).await
    }

    pub async fn close(&self) {
        self.listener.close().await;
    }
}
