//! Loopback proxy listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

use super::handler::{ProxyContext, handle_connection};

/// The accept loop feeding connection workers.
///
/// Concurrency is bounded by a semaphore rather than an unbounded pool: a
/// misbehaving player opening connections in a loop queues instead of
/// exhausting the process.
pub(crate) struct ProxyServer {
    port: u16,
    token: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl ProxyServer {
    /// Bind `127.0.0.1:<preferred_port>`, falling back to an ephemeral port,
    /// and start accepting.
    pub async fn start(
        ctx: Arc<ProxyContext>,
        preferred_port: u16,
        max_connections: usize,
    ) -> Result<Self> {
        let listener = bind_preferred(preferred_port).await?;
        let port = listener.local_addr()?.port();
        info!(port, "proxy server listening on 127.0.0.1");

        let token = CancellationToken::new();
        let accept_token = token.clone();
        let accept_task = tokio::spawn(accept_loop(listener, ctx, accept_token, max_connections));

        Ok(Self {
            port,
            token,
            accept_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting and wait for the accept loop to wind down. In-flight
    /// connection workers finish on their own.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.accept_task.await {
            warn!(error = %e, "proxy accept task did not shut down cleanly");
        }
        info!("proxy server stopped");
    }
}

async fn bind_preferred(preferred_port: u16) -> Result<TcpListener> {
    let preferred: SocketAddr = ([127, 0, 0, 1], preferred_port).into();
    match TcpListener::bind(preferred).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            debug!(port = preferred_port, error = %e, "preferred port unavailable, using ephemeral");
            Ok(TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?)
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    token: CancellationToken,
    max_connections: usize,
) {
    let limiter = Arc::new(Semaphore::new(max_connections));
    loop {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            permit = limiter.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let stream = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _peer)) => stream,
                Err(e) => {
                    // Accept errors after stop are expected and silent.
                    if !token.is_cancelled() {
                        warn!(error = %e, "error accepting connection");
                    }
                    continue;
                }
            },
        };

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let _permit = permit;
            handle_connection(ctx, stream).await;
        });
    }
    debug!("accept loop finished");
}
