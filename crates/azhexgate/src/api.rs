use std::time::Duration;

use azhexgate_protocol::{CreateTunnelRequest, ErrorResponse, TunnelResponse};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway returned {status}: {message}")]
    Status { status: u16, message: String },
}

/// Client for the gateway's tunnel API
#[derive(Clone)]
pub struct GatewayClient {
    base_url: String,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask the gateway for a new tunnel
    pub async fn create_tunnel(
        &self,
        local_port: u16,
        subdomain: Option<&str>,
    ) -> Result<TunnelResponse, ApiError> {
        let request = CreateTunnelRequest {
            subdomain: subdomain.map(str::to_string),
            local_port,
        };

        let response = self
            .client
            .post(format!("{}/api/tunnels", self.base_url))
            .json(&request)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn delete_tunnel(&self, name: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(format!("{}/api/tunnels/{}", self.base_url, name))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

/// Turn a non-2xx response into `ApiError::Status`, using the JSON error body if any
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or(body);
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}
