//! Doorstop daemon
//!
//! Exposes a local UDP service (WireGuard by default) through NAT and serves
//! a small HTTP API reporting the public endpoint.

mod api;
mod config;

use anyhow::Context;
use clap::Parser;
use doorstop_core::TraversalService;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use api::ApiState;
use config::Config;

/// Doorstop - keep a NAT door open for a local UDP service
#[derive(Parser, Debug)]
#[command(name = "doorstop")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Use IPv4 only
    #[arg(short = '4')]
    ipv4: bool,

    /// Use IPv6 only
    #[arg(short = '6')]
    ipv6: bool,

    /// Doorstopper local port
    #[arg(long)]
    port: Option<u16>,

    /// STUN server hostname
    #[arg(long)]
    stun_host: Option<String>,

    /// STUN server port
    #[arg(long)]
    stun_port: Option<u16>,

    /// Local service address
    #[arg(long)]
    local_host: Option<String>,

    /// Local service port
    #[arg(long)]
    local_port: Option<u16>,

    /// iptables binary
    #[arg(long)]
    iptables: Option<String>,

    /// Doorstopper packet interval
    #[arg(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,

    /// Hostname for API server
    #[arg(long)]
    api_host: Option<String>,

    /// Port number for API server
    #[arg(long)]
    api_port: Option<u16>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Protocol selected by `-4`/`-6`; both or neither mean dual stack
    fn protocol(&self) -> Option<&'static str> {
        match (self.ipv4, self.ipv6) {
            (false, false) => None,
            (true, true) => Some("udp"),
            (true, false) => Some("udp4"),
            (false, true) => Some("udp6"),
        }
    }

    /// Overlay command-line values on `config`
    fn apply(self, config: &mut Config) {
        let traversal = &mut config.traversal;
        if let Some(protocol) = self.protocol() {
            traversal.protocol = protocol.to_string();
        }
        if let Some(port) = self.port {
            traversal.port = port;
        }
        if let Some(host) = self.stun_host {
            traversal.stun_host = host;
        }
        if let Some(port) = self.stun_port {
            traversal.stun_port = port;
        }
        if let Some(host) = self.local_host {
            traversal.local_host = host;
        }
        if let Some(port) = self.local_port {
            traversal.local_port = port;
        }
        if let Some(iptables) = self.iptables {
            traversal.iptables = iptables;
        }
        if let Some(interval) = self.interval {
            traversal.interval = interval;
        }

        if let Some(host) = self.api_host {
            config.api.host = host;
        }
        if let Some(port) = self.api_port {
            config.api.port = port;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load_or_default()?,
    };
    cli.apply(&mut config);

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let traversal = config.traversal_config()?;

    let service = Arc::new(TraversalService::new());
    service
        .configure(traversal)
        .await
        .context("invalid configuration")?;
    service
        .start()
        .await
        .context("failed to expose local service")?;

    let (quit, quit_rx) = mpsc::channel(1);
    let app = api::router(ApiState {
        service: Arc::clone(&service),
        quit,
    });

    let listener = tokio::net::TcpListener::bind((config.api.host.as_str(), config.api.port))
        .await
        .with_context(|| {
            format!(
                "failed to bind API server to {}:{}",
                config.api.host, config.api.port
            )
        })?;
    tracing::info!("API server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(quit_rx))
        .await
        .context("API server failed")?;

    tracing::info!("Shutting down");
    if let Err(e) = service.stop().await {
        tracing::error!("{}", e);
    }
    match service.remove_redirect().await {
        Ok(Some(rule)) => tracing::info!("Removed redirect rule {}", rule),
        Ok(None) => {}
        Err(e) => tracing::warn!("Failed to remove redirect: {}", e),
    }

    Ok(())
}

/// Resolves on Ctrl-C or a `/quit` request
async fn shutdown_signal(mut quit: mpsc::Receiver<()>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        }
        _ = quit.recv() => {}
    }
}
