//! In-process SOCKS5 and origin servers for tests.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const USER: &str = "user";
pub const PASS: &str = "pass";

/// An address nothing listens on
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Minimal SOCKS5 server: username/password auth, CONNECT only
pub async fn start_socks5() -> SocketAddr {
    start_slow_socks5(Duration::ZERO).await
}

/// SOCKS5 server that sits on every new connection for `delay` before
/// answering the greeting
pub async fn start_slow_socks5(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = socks5_session(stream).await;
            });
        }
    });
    addr
}

async fn socks5_session(mut stream: TcpStream) -> io::Result<()> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&0x02) {
        return stream.write_all(&[0x05, 0xff]).await;
    }
    stream.write_all(&[0x05, 0x02]).await?;

    let mut ulen = [0u8; 2];
    stream.read_exact(&mut ulen).await?;
    let mut username = vec![0u8; ulen[1] as usize];
    stream.read_exact(&mut username).await?;
    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut password = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut password).await?;
    if username != USER.as_bytes() || password != PASS.as_bytes() {
        return stream.write_all(&[0x01, 0x01]).await;
    }
    stream.write_all(&[0x01, 0x00]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        _ => return Ok(()),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    let mut upstream = TcpStream::connect((host.as_str(), u16::from_be_bytes(port))).await?;
    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
    Ok(())
}

/// Origin server that reports which request headers it received
pub async fn start_origin() -> SocketAddr {
    start_slow_origin(Duration::ZERO).await
}

/// Origin that waits `delay` before sending each response head
pub async fn start_slow_origin(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, Infallible>(echo_headers(&req))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

fn echo_headers(req: &Request<Incoming>) -> Response<Full<Bytes>> {
    let seen = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("absent")
            .to_string()
    };
    Response::builder()
        .status(StatusCode::CREATED)
        .header("x-seen-xff", seen("x-forwarded-for"))
        .header("x-seen-secret", seen("x-secret"))
        .header("x-seen-proxy-auth", seen("proxy-authorization"))
        .header("x-seen-host", seen("host"))
        .header("x-seen-uri", req.uri().to_string())
        .header("connection", "x-internal")
        .header("x-internal", "1")
        .header("keep-alive", "timeout=5")
        .body(Full::new(Bytes::from_static(b"hello from origin")))
        .unwrap()
}
