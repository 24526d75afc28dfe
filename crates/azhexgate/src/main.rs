use anyhow::{Context, Result};
use azhexgate::{ClientConfig, ClientTunnel, GatewayClient};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// AzHexGate - expose a local service through an Azure Relay tunnel
#[derive(Parser, Debug)]
#[command(name = "azhexgate")]
#[command(about = "Expose a local service through an AzHexGate gateway")]
struct Cli {
    /// Local port to expose
    #[arg(short, long)]
    port: u16,

    /// Gateway base URL (e.g., https://tunnel.example.com)
    #[arg(short, long)]
    gateway: Option<String>,

    /// Requested tunnel name (optional, auto-generated if not specified)
    #[arg(long)]
    subdomain: Option<String>,

    /// Host the local service listens on
    #[arg(long)]
    host: Option<String>,
}

/// Resolved configuration from CLI args and/or config file
#[derive(Debug)]
struct ResolvedConfig {
    gateway_url: String,
    local_addr: String,
    local_port: u16,
    subdomain: Option<String>,
}

impl ResolvedConfig {
    fn resolve(cli: &Cli, config_file: Option<&ClientConfig>) -> Result<Self> {
        let gateway_url = cli
            .gateway
            .clone()
            .or_else(|| config_file.and_then(|c| c.gateway_url.clone()))
            .with_context(|| {
                format!(
                    "Gateway URL required. Use --gateway or set gateway_url in {}",
                    ClientConfig::default_path().display()
                )
            })?;

        let host = cli
            .host
            .clone()
            .or_else(|| config_file.and_then(|c| c.local_host.clone()))
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let subdomain = cli
            .subdomain
            .clone()
            .or_else(|| config_file.and_then(|c| c.subdomain.clone()));

        Ok(Self {
            gateway_url,
            local_addr: format!("{}:{}", host, cli.port),
            local_port: cli.port,
            subdomain,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("azhexgate=info".parse()?)
                .add_directive("azhexgate_relay=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config_file = ClientConfig::try_load_default();
    let config = ResolvedConfig::resolve(&cli, config_file.as_ref())?;

    let gateway = GatewayClient::new(&config.gateway_url)?;
    let grant = gateway
        .create_tunnel(config.local_port, config.subdomain.as_deref())
        .await
        .with_context(|| format!("Failed to create tunnel at {}", config.gateway_url))?;

    let tunnel = ClientTunnel::from_response(&grant)
        .with_context(|| format!("Cannot serve tunnel {}", grant.name))?;

    println!();
    println!("  Tunnel established!");
    println!("  {} -> http://{}", tunnel.public_url(), config.local_addr);
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    let cancel = CancellationToken::new();
    let result = tokio::select! {
        result = tunnel.run(&config.local_addr, cancel.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down");
            cancel.cancel();
            Ok(())
        }
    };

    tunnel.close().await;
    if let Err(e) = gateway.delete_tunnel(tunnel.name()).await {
        tracing::warn!("Failed to delete tunnel {}: {}", tunnel.name(), e);
    }

    result.with_context(|| format!("Tunnel {} stopped", tunnel.name()))
}
