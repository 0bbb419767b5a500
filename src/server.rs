use crate::connection::SessionGuard;
use crate::proxy::ForwardProxy;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Accept connections forever, serving each one on its own task
pub async fn serve(listener: TcpListener, proxy: Arc<ForwardProxy>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Accept error: {} (continuing)", e);
                continue;
            }
        };
        debug!("Accepted connection from {}", peer_addr);

        let proxy = Arc::clone(&proxy);
        tokio::task::spawn(async move {
            let _guard = SessionGuard::new();
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let proxy = Arc::clone(&proxy);
                async move { proxy.handle(req, peer_addr).await }
            });

            if let Err(err) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                // Only log connection errors, not normal endings
                if !err.is_incomplete_message() {
                    warn!("Connection from {} error: {:?}", peer_addr, err);
                }
            }
        });
    }
}
