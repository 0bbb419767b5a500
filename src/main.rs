//! HTTP forward proxy that relays traffic through an authenticated SOCKS5 proxy.
//!
//! Plain requests are forwarded over SOCKS5; CONNECT requests are tunneled as
//! raw bytes over a direct TCP connection to the target.

mod auth;
mod client;
mod config;
mod connection;
mod headers;
mod proxy;
mod server;
mod socks;
#[cfg(test)]
mod testing;
mod tunnel;

use crate::config::{Cli, ProxyConfig};
use crate::connection::SessionGuard;
use crate::proxy::ForwardProxy;
use clap::Parser;
use color_eyre::eyre::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DRAIN_SECONDS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sfproxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = ProxyConfig::from_cli(args)?;

    info!("Starting proxy server on {}", config.listen_addr);
    info!("SOCKS5 backend: {} (user {})", config.socks.addr, config.socks.auth.username);

    let proxy = Arc::new(ForwardProxy::new(&config)?);
    let listener = TcpListener::bind(config.listen_addr).await?;

    // Log the active session count whenever it changes
    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        let mut last_active = 0;
        loop {
            interval.tick().await;
            let active = SessionGuard::active_count();
            if active != last_active {
                info!("Active sessions: {}", active);
                last_active = active;
            }
        }
    });

    tokio::select! {
        _ = server::serve(listener, proxy) => {
            warn!("Server loop terminated");
            return Ok(());
        }
        signaled = signal::ctrl_c() => {
            signaled?;
            info!("Shutdown signal received");
        }
    }

    drain_sessions().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Give open connections and tunnels a bounded time to finish
async fn drain_sessions() {
    let active = SessionGuard::active_count();
    if active == 0 {
        return;
    }
    info!("Waiting for {} sessions to close...", active);

    for i in 1..=DRAIN_SECONDS {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let remaining = SessionGuard::active_count();

        if remaining == 0 {
            info!("All sessions closed gracefully");
            return;
        }

        if i % 5 == 0 {
            info!(
                "Still waiting for {} sessions... ({}/{}s)",
                remaining, i, DRAIN_SECONDS
            );
        }
    }

    warn!(
        "Forced shutdown with {} sessions still active",
        SessionGuard::active_count()
    );
}
