use std::net::SocketAddr;

use anyhow::{Context, Result};
use azhexgate_gateway::{GatewayConfig, HttpPlane, TunnelManager};
use azhexgate_protocol::{CreateTunnelRequest, TransportMode};
use azhexgate_relay::forward;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// AzHexGate gateway - issues tunnels and proxies public traffic through them
#[derive(Parser, Debug)]
#[command(name = "azhexgate-gateway")]
#[command(about = "Reverse tunnel gateway backed by Azure Relay Hybrid Connections")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "gateway.toml")]
    config: String,

    /// Serve a tunnel in-process (local mode), e.g. --expose myapp=127.0.0.1:3000
    #[arg(long, value_name = "NAME=HOST:PORT")]
    expose: Vec<String>,
}

/// One `--expose NAME=HOST:PORT` argument
#[derive(Debug, PartialEq, Eq)]
struct Expose {
    name: String,
    addr: String,
    port: u16,
}

fn parse_expose(value: &str) -> Result<Expose> {
    let (name, addr) = value
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Invalid --expose '{}'. Expected NAME=HOST:PORT", value))?;
    let port = addr
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("Invalid address in --expose '{}'", value))?;
    Ok(Expose {
        name: name.to_string(),
        addr: addr.to_string(),
        port,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Relay WebSockets use rustls; ignore the error if a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("azhexgate_gateway=info".parse()?)
                .add_directive("azhexgate_relay=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting gateway with config: {}", args.config);

    let config = GatewayConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    tracing::info!("Base domain: {}", config.base_domain);
    tracing::info!("Mode: {:?}", config.mode);
    tracing::info!("HTTP plane port: {}", config.http_port);

    let manager = TunnelManager::from_config(&config).context("Failed to set up tunnels")?;
    let shutdown = CancellationToken::new();

    if !args.expose.is_empty() && config.mode != TransportMode::Local {
        anyhow::bail!("--expose is only supported in local mode");
    }

    for arg in &args.expose {
        let expose = parse_expose(arg)?;
        let grant = manager
            .create_tunnel(&CreateTunnelRequest {
                subdomain: Some(expose.name),
                local_port: expose.port,
            })
            .with_context(|| format!("Failed to expose {}", arg))?;
        let listener = manager
            .take_listener(&grant.name)
            .ok_or_else(|| anyhow::anyhow!("No local listener for {}", grant.name))?;

        tracing::info!(
            "Exposing {}://{}.{} -> {}",
            config.public_scheme,
            grant.name,
            config.base_domain,
            expose.addr
        );
        tokio::spawn(forward::serve(listener, expose.addr, shutdown.clone()));
    }

    let http_plane = HttpPlane::new(
        manager.clone(),
        config.base_domain.clone(),
        config.public_scheme.clone(),
        config.request_timeout,
    );

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;

    tokio::select! {
        result = http_plane.run(http_addr) => {
            tracing::error!("HTTP plane stopped: {:?}", result);
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    shutdown.cancel();
    manager.shutdown().await;

    tracing::info!("Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
