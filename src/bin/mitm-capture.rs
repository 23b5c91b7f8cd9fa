use anyhow::{Context, Result};
use clap::Parser;
use mitm_capture::{CaptureStore, ProxyConfig, ProxyServer, ProxyState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Intercepting HTTP/HTTPS proxy that logs every request it relays.
///
/// Point a client's HTTP proxy at the listen address and trust the CA
/// certificate found in the CA directory to see decrypted HTTPS traffic.
#[derive(Parser, Debug)]
#[command(name = "mitm-capture")]
#[command(version, about)]
struct Args {
    /// Path to the proxy configuration file (YAML).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration file.
    #[arg(short = 'l', long)]
    listen: Option<SocketAddr>,

    /// Directory holding ca.crt and ca.key, overriding the configuration file.
    #[arg(long)]
    ca_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let mut config = match args.config {
        Some(path) => ProxyConfig::load(&path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => ProxyConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(ca_dir) = args.ca_dir {
        config.ca_dir = ca_dir;
    }

    let store = Arc::new(CaptureStore::new());
    let state = Arc::new(ProxyState::from_config(&config, store));
    let server = ProxyServer::bind(config.listen, state)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;

    if server.state().is_degraded() {
        warn!("running without a CA: HTTPS requests will not be captured");
    }

    server.run().await.context("proxy server failed")
}
