use crate::auth::Auth;
use crate::config::SocksUpstream;
use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tower_service::Service;

/// Error type for SOCKS5 connection operations
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("invalid SOCKS5 proxy address {0:?}, expected host:port")]
    InvalidProxyAddress(String),

    #[error("destination {0} has no host")]
    MissingHost(Uri),

    #[error("SOCKS5 connection failed: {0}")]
    ConnectionFailed(#[from] tokio_socks::Error),
}

/// Result type for SOCKS5 operations
pub type SocksResult<T> = Result<T, SocksError>;

/// Dials destinations exclusively through an authenticated SOCKS5 proxy.
///
/// Implements `Service<Uri>` so it can serve as the transport of a hyper client.
#[derive(Clone, Debug)]
pub struct SocksConnector {
    socks_addr: Arc<str>,
    auth: Arc<Auth>,
}

impl SocksConnector {
    /// Create a connector for the given upstream, checking the address shape
    pub fn new(upstream: &SocksUpstream) -> SocksResult<Self> {
        validate_proxy_addr(&upstream.addr)?;
        Ok(Self {
            socks_addr: Arc::from(upstream.addr.as_str()),
            auth: Arc::new(upstream.auth.clone()),
        })
    }

    /// Open a SOCKS5 stream to `host:port`
    pub async fn connect(&self, host: &str, port: u16) -> SocksResult<SocksStream> {
        let stream = Socks5Stream::connect_with_password(
            &*self.socks_addr,
            (host, port),
            &self.auth.username,
            &self.auth.password,
        )
        .await?;
        Ok(SocksStream::new(stream))
    }

    /// Get the SOCKS5 server address
    #[cfg(test)]
    pub fn socks_addr(&self) -> &str {
        &self.socks_addr
    }
}

impl Service<Uri> for SocksConnector {
    type Response = SocksStream;
    type Error = SocksError;
    type Future = Pin<Box<dyn Future<Output = SocksResult<SocksStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move {
            let (host, port) = destination(&dst)?;
            connector.connect(&host, port).await
        })
    }
}

/// Host and port the SOCKS5 proxy should connect to for `uri`
fn destination(uri: &Uri) -> SocksResult<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| SocksError::MissingHost(uri.clone()))?;
    // IPv6 literals keep their brackets in the URI
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    Ok((host, port))
}

fn validate_proxy_addr(addr: &str) -> SocksResult<()> {
    let invalid = || SocksError::InvalidProxyAddress(addr.to_string());
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}

/// A connection tunneled through the SOCKS5 proxy
pub struct SocksStream {
    inner: TokioIo<Socks5Stream<TcpStream>>,
}

impl SocksStream {
    fn new(stream: Socks5Stream<TcpStream>) -> Self {
        Self {
            inner: TokioIo::new(stream),
        }
    }
}

impl Connection for SocksStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl Read for SocksStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl Write for SocksStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
