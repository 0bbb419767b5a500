//! Hop-by-hop header hygiene and forwarding metadata.
//!
//! See RFC 7230, section 6.1 for the definition of hop-by-hop headers.

use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE,
};

const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that are meaningful only for a single transport-level connection
pub const HOP_HEADERS: [HeaderName; 9] = [
    CONNECTION,
    PROXY_CONNECTION,
    KEEP_ALIVE,
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Remove the fixed set of hop-by-hop headers
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    for name in &HOP_HEADERS {
        headers.remove(name);
    }
}

/// Remove the headers declared hop-by-hop by the `Connection` header
pub fn remove_connection_headers(headers: &mut HeaderMap) {
    let declared: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| HeaderName::from_bytes(token.as_bytes()).ok())
        .collect();

    for name in declared {
        headers.remove(name);
    }
}

/// Strip every hop-by-hop header, static and `Connection`-declared.
///
/// Used on both request and response headers.
pub fn sanitize(headers: &mut HeaderMap) {
    // Connection tokens must be read before Connection itself goes away
    remove_connection_headers(headers);
    remove_hop_headers(headers);
}

/// Append `client_ip` to `X-Forwarded-For`, keeping any earlier chain.
///
/// Multiple prior headers are folded into one comma+space separated value.
pub fn append_forwarded_for(headers: &mut HeaderMap, client_ip: &str) {
    // Raw bytes, so opaque prior entries survive the fold
    let mut chain: Vec<&[u8]> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .map(HeaderValue::as_bytes)
        .collect();
    chain.push(client_ip.as_bytes());

    match HeaderValue::from_bytes(&chain.join(&b", "[..])) {
        Ok(value) => {
            headers.insert(X_FORWARDED_FOR, value);
        }
        Err(e) => tracing::warn!("Dropping invalid X-Forwarded-For chain: {}", e),
    }
}
