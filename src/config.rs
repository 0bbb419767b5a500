use crate::auth::Auth;
use clap::Parser;
use std::net::{AddrParseError, SocketAddr};

/// Command line interface configuration
///
/// Every setting can also come from the environment; an explicit flag wins.
#[derive(Parser, Debug, Clone)]
#[command(
    author, version,
    about = "HTTP forward proxy over an authenticated SOCKS5 upstream",
    long_about = "sfproxy accepts HTTP proxy requests and relays them through an upstream SOCKS5 proxy.\n\n- Plain HTTP/HTTPS requests are forwarded through SOCKS5 with username/password auth\n- CONNECT requests are tunneled as raw bytes over a direct TCP connection\n"
)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "HTTP_ADDRESS", default_value = "0.0.0.0:8080", value_name = "IP:PORT")]
    pub http_address: String,

    /// SOCKS5 proxy to use
    #[arg(long, env = "SOCKS_PROXY", value_name = "HOST:PORT")]
    pub socks_proxy: Option<String>,

    /// SOCKS5 proxy user
    #[arg(long, env = "SOCKS_PROXY_USER")]
    pub socks_proxy_user: Option<String>,

    /// SOCKS5 proxy password
    #[arg(long, env = "SOCKS_PROXY_PASSWORD", hide_env_values = true)]
    pub socks_proxy_password: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("HTTP address must be a valid IP address and port: {0}")]
    InvalidHttpAddress(#[source] AddrParseError),

    #[error("SOCKS5 proxy must be set")]
    MissingSocksProxy,

    #[error("SOCKS5 proxy user must be set when SOCKS5 proxy is set")]
    MissingSocksUser,

    #[error("SOCKS5 proxy password must be set when SOCKS5 proxy is set")]
    MissingSocksPassword,
}

/// Upstream SOCKS5 proxy and its credentials
#[derive(Clone, Debug)]
pub struct SocksUpstream {
    pub addr: String,
    pub auth: Auth,
}

/// Proxy server configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub socks: SocksUpstream,
}

impl ProxyConfig {
    /// Validate CLI arguments into a configuration
    pub fn from_cli(args: Cli) -> Result<Self, ConfigError> {
        let listen_addr = args
            .http_address
            .parse::<SocketAddr>()
            .map_err(ConfigError::InvalidHttpAddress)?;

        let addr = non_empty(args.socks_proxy).ok_or(ConfigError::MissingSocksProxy)?;
        let username = non_empty(args.socks_proxy_user).ok_or(ConfigError::MissingSocksUser)?;
        let password =
            non_empty(args.socks_proxy_password).ok_or(ConfigError::MissingSocksPassword)?;

        Ok(Self {
            listen_addr,
            socks: SocksUpstream {
                addr,
                auth: Auth::new(username, password),
            },
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
