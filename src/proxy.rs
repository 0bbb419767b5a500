use crate::client::{tls_config, BoxError, ClientError, ClientTimeouts, OutboundClient};
use crate::config::{ProxyConfig, SocksUpstream};
use crate::headers;
use crate::tunnel::TunnelSession;
use bytes::Bytes;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderValue, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HOST, X_CONTENT_TYPE_OPTIONS};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use rustls::ClientConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Body type of every response the proxy returns
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("unsupported protocol scheme {0}")]
    UnsupportedScheme(String),

    #[error("HTTP request missing host")]
    MissingHost,

    #[error("invalid target URL: {0}")]
    InvalidUri(#[from] http::Error),
}

/// Dispatches inbound proxy requests to the SOCKS5 request path or a raw tunnel
pub struct ForwardProxy {
    socks: SocksUpstream,
    tls: ClientConfig,
    timeouts: ClientTimeouts,
}

impl ForwardProxy {
    pub fn new(config: &ProxyConfig) -> Result<Self, ClientError> {
        Ok(Self {
            socks: config.socks.clone(),
            tls: tls_config()?,
            timeouts: ClientTimeouts::default(),
        })
    }

    #[cfg(test)]
    pub fn with_timeouts(mut self, timeouts: ClientTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Handle one inbound request; every failure becomes a response
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();
        info!("{}\t{}\t{}\tHost: {}", peer, req.method(), req.uri(), host);
        debug!("\t{:?}", req.headers());

        if req.method() == Method::CONNECT {
            Ok(self.proxy_connect(req, peer).await)
        } else {
            Ok(self.proxy_request(req, peer).await)
        }
    }

    async fn proxy_request(&self, mut req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let target = match resolve_target(req.uri(), req.headers().get(HOST)) {
            Ok(target) => target,
            Err(e) => {
                warn!("Rejecting request from {}: {}", peer, e);
                return text_response(StatusCode::BAD_REQUEST, e.to_string());
            }
        };

        let client = match OutboundClient::new(&self.socks, &self.tls, self.timeouts) {
            Ok(client) => client,
            Err(e) => {
                let msg = format!("failed create http client: {}", e);
                warn!("{}", msg);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, msg);
            }
        };

        // The outbound request line is derived from the absolute target URL
        *req.uri_mut() = target;

        headers::sanitize(req.headers_mut());
        headers::append_forwarded_for(req.headers_mut(), &peer.ip().to_string());

        let resp = match client.send(req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Request from {} failed: {}", peer, e);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Server Error");
            }
        };
        info!("{} {}", peer, resp.status());

        let (mut parts, body) = resp.into_parts();
        headers::sanitize(&mut parts.headers);

        // Status and headers are committed by the time the body streams
        let body = body
            .map_err(move |e| {
                warn!("Copying response body to {} failed: {}", peer, e);
                e
            })
            .boxed_unsync();
        Response::from_parts(parts, body)
    }

    async fn proxy_connect(&self, mut req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let target = match req.uri().authority() {
            Some(authority) => authority.to_string(),
            None => {
                warn!("CONNECT host is not socket addr: {:?}", req.uri());
                return text_response(StatusCode::BAD_REQUEST, "CONNECT must be to a socket address");
            }
        };
        info!("CONNECT requested to {} (from {})", target, peer);

        let mut session = TunnelSession::new(peer, target);
        let target_conn = match session.dial().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to dial to target for {}: {}", peer, e);
                return text_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
            }
        };

        // Resolves after the 200 below has been written to the client
        let takeover = req.extensions_mut().remove::<OnUpgrade>();
        tokio::task::spawn(session.run(takeover, target_conn));

        Response::new(empty())
    }
}

/// Scheme for a target URL that does not name one
pub fn infer_scheme(port: Option<u16>) -> Scheme {
    if port == Some(443) {
        Scheme::HTTPS
    } else {
        Scheme::HTTP
    }
}

/// Build the absolute URL a non-CONNECT request should be sent to.
///
/// The authority comes from the request URI, or from `Host` for origin-form
/// requests.
pub fn resolve_target(uri: &Uri, host: Option<&HeaderValue>) -> Result<Uri, TargetError> {
    let authority = match uri.authority() {
        Some(authority) => authority.clone(),
        None => host
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse::<Authority>().ok())
            .ok_or(TargetError::MissingHost)?,
    };

    let scheme = match uri.scheme() {
        Some(scheme) => scheme.clone(),
        None => infer_scheme(authority.port_u16()),
    };
    if scheme != Scheme::HTTP && scheme != Scheme::HTTPS {
        return Err(TargetError::UnsupportedScheme(scheme.to_string()));
    }

    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    Ok(Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path)
        .build()?)
}

fn text_response(status: StatusCode, msg: impl Into<String>) -> Response<ProxyBody> {
    let mut body = msg.into();
    body.push('\n');

    let mut resp = Response::new(full(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp.headers_mut()
        .insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    resp
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}
