//! Raw byte tunnel for CONNECT sessions.
//!
//! A session moves through `Dialing -> Established -> Relaying -> Closed`.
//! Relaying runs on two tasks, one per direction: the session's own task
//! copies target to client and a spawned task copies client to target. When
//! either direction finishes it shuts down its destination and signals the
//! session closed, so the sibling stops on its own and both connections are
//! dropped.

use crate::connection::SessionGuard;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BUFFER_SIZE: usize = 16 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TunnelState {
    Dialing,
    Established,
    Relaying,
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Dialing => "dialing",
            TunnelState::Established => "established",
            TunnelState::Relaying => "relaying",
            TunnelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TakeoverError {
    #[error("raw connection takeover failed: {0}")]
    Failed(#[source] hyper::Error),

    #[error("transport does not support raw connection takeover")]
    Unsupported,
}

/// Capability to detach the client connection from the HTTP layer.
///
/// Resolves once the response head has been written and the connection is
/// free for raw bytes.
pub trait RawTakeover {
    type Io: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn take_over(self) -> impl Future<Output = Result<Self::Io, TakeoverError>> + Send;
}

/// hyper leaves an `OnUpgrade` in the request extensions when the
/// connection can be handed off
impl RawTakeover for Option<OnUpgrade> {
    type Io = TokioIo<Upgraded>;

    fn take_over(self) -> impl Future<Output = Result<Self::Io, TakeoverError>> + Send {
        async move {
            let on_upgrade = self.ok_or(TakeoverError::Unsupported)?;
            on_upgrade
                .await
                .map(TokioIo::new)
                .map_err(TakeoverError::Failed)
        }
    }
}

/// Bytes relayed in each direction over a tunnel's lifetime
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TunnelSummary {
    pub client_to_target: u64,
    pub target_to_client: u64,
}

#[derive(Copy, Clone, Debug)]
enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToTarget => f.write_str("client->target"),
            Direction::TargetToClient => f.write_str("target->client"),
        }
    }
}

/// One CONNECT session between a client and its target
pub struct TunnelSession {
    peer: SocketAddr,
    target: String,
    state: TunnelState,
}

impl TunnelSession {
    pub fn new(peer: SocketAddr, target: impl Into<String>) -> Self {
        Self {
            peer,
            target: target.into(),
            state: TunnelState::Dialing,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> TunnelState {
        self.state
    }

    fn advance(&mut self, next: TunnelState) {
        debug!(
            "Tunnel {} -> {}: {} => {}",
            self.peer, self.target, self.state, next
        );
        self.state = next;
    }

    /// Dial the target directly over TCP
    pub async fn dial(&mut self) -> io::Result<TcpStream> {
        match TcpStream::connect(self.target.as_str()).await {
            Ok(stream) => {
                self.advance(TunnelState::Established);
                Ok(stream)
            }
            Err(e) => {
                self.advance(TunnelState::Closed);
                Err(e)
            }
        }
    }

    /// Take over the client connection and relay until both directions end
    pub async fn run<R: RawTakeover>(mut self, takeover: R, target: TcpStream) -> TunnelSummary {
        let _guard = SessionGuard::new();

        let client = match takeover.take_over().await {
            Ok(client) => client,
            Err(e) => {
                warn!("Tunnel {} -> {} not created: {}", self.peer, self.target, e);
                self.advance(TunnelState::Closed);
                return TunnelSummary::default();
            }
        };

        self.advance(TunnelState::Relaying);
        info!("Tunnel established {} -> {}", self.peer, self.target);

        let label: Arc<str> = Arc::from(format!("{} -> {}", self.peer, self.target));
        let summary = relay(client, target, label).await;

        self.advance(TunnelState::Closed);
        info!(
            "Tunnel closed {} -> {}: {}↑ {}↓ bytes",
            self.peer, self.target, summary.client_to_target, summary.target_to_client
        );
        summary
    }
}

/// Splice `client` and `target` until both copy directions have finished.
///
/// Client-to-target runs on a spawned task; target-to-client runs on the
/// caller's task.
pub async fn relay<C, T>(client: C, target: T, label: Arc<str>) -> TunnelSummary
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (target_rd, target_wr) = tokio::io::split(target);
    let closed = CancellationToken::new();

    let upstream = tokio::spawn(pipe(
        client_rd,
        target_wr,
        closed.clone(),
        Direction::ClientToTarget,
        label.clone(),
    ));
    let target_to_client = pipe(
        target_rd,
        client_wr,
        closed,
        Direction::TargetToClient,
        label.clone(),
    )
    .await;

    let client_to_target = upstream.await.unwrap_or_else(|e| {
        warn!("Tunnel {} copy task failed: {}", label, e);
        0
    });

    TunnelSummary {
        client_to_target,
        target_to_client,
    }
}

/// Copy `src` into `dst` until EOF, an error, or the session closes
async fn pipe<R, W>(
    mut src: R,
    mut dst: W,
    closed: CancellationToken,
    direction: Direction,
    label: Arc<str>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut copied = 0u64;

    let result: io::Result<()> = 'copy: loop {
        let n = tokio::select! {
            _ = closed.cancelled() => break 'copy Ok(()),
            read = src.read(&mut buf) => match read {
                Ok(0) => break 'copy Ok(()),
                Ok(n) => n,
                Err(e) => break 'copy Err(e),
            },
        };
        tokio::select! {
            _ = closed.cancelled() => break 'copy Ok(()),
            written = dst.write_all(&buf[..n]) => {
                if let Err(e) = written {
                    break 'copy Err(e);
                }
            }
        }
        copied += n as u64;
    };

    if let Err(e) = result {
        warn!("Tunnel {} {} copy error: {}", label, direction, e);
    }

    closed.cancel();
    match tokio::time::timeout(SHUTDOWN_GRACE, dst.shutdown()).await {
        Ok(Err(e)) => debug!("Tunnel {} {} shutdown error: {}", label, direction, e),
        Err(_) => debug!("Tunnel {} {} shutdown timed out", label, direction),
        Ok(Ok(())) => {}
    }

    copied
}
