//! Outbound HTTP client that reaches the origin only through SOCKS5.
//!
//! Timeout values follow the recommendations in
//! <https://blog.cloudflare.com/the-complete-guide-to-golang-net-http-timeouts/>.

use crate::config::SocksUpstream;
use crate::socks::{SocksConnector, SocksError, SocksStream};
use bytes::Bytes;
use http::uri::PathAndQuery;
use http::{HeaderValue, Uri};
use http_body::{Body, Frame, SizeHint};
use hyper::body::Incoming;
use hyper::client::conn::http1::Builder;
use hyper::header::HOST;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder, MaybeHttpsStream};
use rustls::{ClientConfig, RootCertStore};
use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tower_service::Service;
use tracing::debug;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Timeouts applied to every outbound request.
///
/// The connect and response header budgets run one after the other; the
/// request budget spans both plus the body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientTimeouts {
    /// Whole exchange, from dial until the last body byte
    pub request: Duration,
    /// Connect phase: SOCKS5 negotiation plus TLS handshake
    pub tls_handshake: Duration,
    /// Wait for the response head once the connection is up
    pub response_header: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(15),
            tls_handshake: Duration::from_secs(10),
            response_header: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to set up TLS: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Socks(#[from] SocksError),

    #[error("connect to upstream failed: {0}")]
    Connect(BoxError),

    #[error("connect to upstream timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("no response headers within {0:?}")]
    ResponseHeaderTimeout(Duration),

    #[error("request exceeded deadline of {0:?}")]
    Deadline(Duration),

    #[error("upstream request failed: {0}")]
    Request(#[from] hyper::Error),
}

/// Build the TLS configuration shared by all outbound sessions
pub fn tls_config() -> Result<ClientConfig, ClientError> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(config)
}

type Connector = HttpsConnector<SocksConnector>;
type Upstream = MaybeHttpsStream<SocksStream>;

/// One outbound session: a single HTTP/1.1 connection through the SOCKS5 upstream
pub struct OutboundClient {
    connector: Connector,
    timeouts: ClientTimeouts,
}

impl OutboundClient {
    /// Build a client whose only transport is the given SOCKS5 upstream
    pub fn new(
        upstream: &SocksUpstream,
        tls: &ClientConfig,
        timeouts: ClientTimeouts,
    ) -> Result<Self, ClientError> {
        let socks = SocksConnector::new(upstream)?;
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls.clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(socks);

        Ok(Self {
            connector,
            timeouts,
        })
    }

    /// Send `req` to the absolute URL in its URI and wait for the response head.
    ///
    /// The returned body keeps enforcing the overall request deadline.
    pub async fn send<B>(
        &self,
        req: Request<B>,
    ) -> Result<Response<DeadlineBody<Incoming>>, ClientError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let limit = self.timeouts.request;
        let deadline = Instant::now() + limit;

        let resp = match tokio::time::timeout_at(deadline, self.exchange(req)).await {
            Ok(resp) => resp?,
            Err(_) => return Err(ClientError::Deadline(limit)),
        };
        Ok(resp.map(|body| DeadlineBody::new(body, deadline, limit)))
    }

    async fn exchange<B>(&self, mut req: Request<B>) -> Result<Response<Incoming>, ClientError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let io = match tokio::time::timeout(self.timeouts.tls_handshake, self.connect(req.uri()))
            .await
        {
            Ok(io) => io?,
            Err(_) => return Err(ClientError::HandshakeTimeout(self.timeouts.tls_handshake)),
        };

        let (mut sender, conn) = Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await?;
        tokio::task::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection ended: {}", e);
            }
        });
        sender.ready().await?;

        to_origin_form(&mut req);
        match tokio::time::timeout(self.timeouts.response_header, sender.send_request(req)).await {
            Ok(resp) => Ok(resp?),
            Err(_) => Err(ClientError::ResponseHeaderTimeout(
                self.timeouts.response_header,
            )),
        }
    }

    /// Dial the target through SOCKS5, adding TLS for https
    async fn connect(&self, dst: &Uri) -> Result<Upstream, ClientError> {
        let mut connector = self.connector.clone();
        poll_fn(|cx| connector.poll_ready(cx))
            .await
            .map_err(ClientError::Connect)?;
        connector
            .call(dst.clone())
            .await
            .map_err(ClientError::Connect)
    }
}

/// Rewrite an absolute-form request for the origin: path-only request line
/// and a `Host` header when the client sent none
fn to_origin_form<B>(req: &mut Request<B>) {
    if !req.headers().contains_key(HOST) {
        let host = req
            .uri()
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok());
        if let Some(host) = host {
            req.headers_mut().insert(HOST, host);
        }
    }

    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *req.uri_mut() = Uri::from(path);
}

/// Response body that fails once the request deadline passes
pub struct DeadlineBody<B> {
    inner: B,
    deadline: Pin<Box<Sleep>>,
    limit: Duration,
}

impl<B> DeadlineBody<B> {
    pub fn new(inner: B, deadline: Instant, limit: Duration) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            limit,
        }
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame.map(|f| f.map_err(Into::into)));
        }
        match this.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Some(Err(ClientError::Deadline(this.limit).into()))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
