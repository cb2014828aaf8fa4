//! The shared accept loop every tier runs.
//!
//! One listening socket, one task per accepted connection, workers bounded
//! by a per-tier admission semaphore and a per-request timeout. The loop
//! exits when the shutdown channel flips, which happens either externally
//! (signal handler) or when a connection delivers the `stop` control line.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::protocol::error::{Result, TierwayError};
use crate::protocol::{Request, Response, SENTINEL, STOP_ACK, STOP_COMMAND};
use crate::transport::codec;

/// Per-tier admission settings.
///
/// `max_connections` is the admission-queue depth: the number of connections
/// allowed in flight at once. Each tier sets its own depth (60 at the
/// balancer, 30 at a proxy, 10 at a server by default).
#[derive(Debug, Clone, Copy)]
pub struct AcceptConfig {
    pub max_connections: usize,
    pub request_timeout: std::time::Duration,
}

impl Default for AcceptConfig {
    fn default() -> Self {
        AcceptConfig {
            max_connections: 32,
            request_timeout: crate::transport::DEFAULT_TIMEOUT,
        }
    }
}

/// A decoded request together with the exact line it arrived as.
///
/// Relaying tiers forward `raw` verbatim; the parsed view is for routing and
/// validation.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub request: Request,
    pub raw: String,
}

/// Async TCP server shared by all three serving tiers.
pub struct TcpServer {
    listener: TcpListener,
    config: AcceptConfig,
}

impl TcpServer {
    /// Binds to the given address. A bind failure is fatal to the process
    /// by contract, so callers propagate this error straight out of startup.
    pub async fn bind(addr: &str, config: AcceptConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TierwayError::Connection(format!("Failed to bind to {addr}: {e}")))?;
        Ok(TcpServer { listener, config })
    }

    /// The actual bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| TierwayError::Connection(format!("Failed to get local addr: {e}")))
    }

    /// Accepts connections until the shutdown channel flips to `true`,
    /// then waits for in-flight connections to finish.
    ///
    /// Every connection is handled on its own task: one request frame in,
    /// one response frame out, bounded by the request timeout. Handler and
    /// parse failures answer with the sentinel; only accept failures on the
    /// listener itself abort the loop.
    pub async fn run_with_handler<F, Fut>(self, handler: F, shutdown: watch::Sender<bool>) -> Result<()>
    where
        F: Fn(Inbound) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Response>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        let mut shutdown_rx = shutdown.subscribe();

        loop {
            // Admission first: never accept more than the tier's depth.
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|_| TierwayError::Connection("admission semaphore closed".into()))?,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => accepted
                    .map_err(|e| TierwayError::Connection(format!("Failed to accept connection: {e}")))?,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };
            debug!(%peer, "connection accepted");

            let handler = handler.clone();
            let shutdown = shutdown.clone();
            let request_timeout = self.config.request_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                match tokio::time::timeout(request_timeout, handle_connection(stream, handler, shutdown)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(%peer, "connection error: {e}"),
                    Err(_) => warn!(%peer, "connection timed out"),
                }
            });
        }

        // Drain: every worker holds a permit until it finishes, and each is
        // bounded by the request timeout, so this wait is bounded too.
        let _ = semaphore.acquire_many(self.config.max_connections as u32).await;
        info!("listener stopped");
        Ok(())
    }
}

/// Handles a single connection: exactly one message, exactly one reply.
async fn handle_connection<F, Fut>(
    mut stream: TcpStream,
    handler: Arc<F>,
    shutdown: watch::Sender<bool>,
) -> Result<()>
where
    F: Fn(Inbound) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Response>> + Send + 'static,
{
    let line = match codec::read_frame(&mut stream).await {
        Ok(Some(line)) => line,
        // Peer connected and left without a message.
        Ok(None) => return Ok(()),
        Err(e @ TierwayError::FrameTooLarge(_)) => {
            warn!("rejecting frame: {e}");
            return codec::write_frame(&mut stream, SENTINEL).await;
        }
        Err(e) => return Err(e),
    };

    if line.trim() == STOP_COMMAND {
        info!("stop request received, shutting down");
        let _ = codec::write_frame(&mut stream, STOP_ACK).await;
        let _ = shutdown.send(true);
        return Ok(());
    }

    let request = match Request::parse(&line) {
        Ok(request) => request,
        Err(e) => {
            warn!("malformed request '{line}': {e}");
            return codec::write_frame(&mut stream, SENTINEL).await;
        }
    };

    let response = match handler(Inbound { request, raw: line }).await {
        Ok(response) => response,
        Err(e) => {
            warn!("handler error: {e}");
            Response::Illegal
        }
    };

    codec::write_frame(&mut stream, &response.to_string()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpTransport;

    fn test_config() -> AcceptConfig {
        AcceptConfig {
            max_connections: 4,
            request_timeout: std::time::Duration::from_secs(2),
        }
    }

    async fn spawn_echo_server() -> (String, watch::Sender<bool>, tokio::task::JoinHandle<Result<()>>) {
        let server = TcpServer::bind("127.0.0.1:0", test_config()).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tx = shutdown_tx.clone();
        let handle = tokio::spawn(async move {
            // Hold a receiver so `send` on the test side cannot race the
            // server task's own `subscribe` and fail with no receivers.
            let _rx = shutdown_rx;
            server
                .run_with_handler(|inbound| async move { Ok(Response::Value(inbound.request.value)) }, tx)
                .await
        });
        // Let the server task run up to its accept loop so it has subscribed
        // to the shutdown channel before any test flips it.
        tokio::task::yield_now().await;
        (addr, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_request_gets_response() {
        let (addr, _shutdown, _handle) = spawn_echo_server().await;
        let response = TcpTransport::new().exchange(&addr, "7 16.0").await.unwrap();
        assert_eq!(response, "16.00");
    }

    #[tokio::test]
    async fn test_malformed_request_gets_sentinel() {
        let (addr, _shutdown, _handle) = spawn_echo_server().await;
        let response = TcpTransport::new().exchange(&addr, "not a request").await.unwrap();
        assert_eq!(response, SENTINEL);
    }

    #[tokio::test]
    async fn test_handler_error_gets_sentinel() {
        let server = TcpServer::bind("127.0.0.1:0", test_config()).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let (shutdown_tx, _) = watch::channel(false);
        tokio::spawn(async move {
            server
                .run_with_handler(
                    |_| async move { Err(TierwayError::Connection("downstream gone".into())) },
                    shutdown_tx,
                )
                .await
        });

        let response = TcpTransport::new().exchange(&addr, "1 4.0").await.unwrap();
        assert_eq!(response, SENTINEL);
    }

    #[tokio::test]
    async fn test_stop_command_stops_listener() {
        let (addr, _shutdown, handle) = spawn_echo_server().await;
        let ack = TcpTransport::new().exchange(&addr, STOP_COMMAND).await.unwrap();
        assert_eq!(ack, STOP_ACK);

        // The accept loop must terminate.
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_external_shutdown_stops_listener() {
        let (_addr, shutdown, handle) = spawn_echo_server().await;
        shutdown.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_frame_gets_sentinel() {
        let (addr, _shutdown, _handle) = spawn_echo_server().await;

        let mut stream = TcpTransport::new().connect(&addr).await.unwrap();
        let oversized = "9".repeat(MAX_FRAME_LEN_PLUS_ONE);
        tokio::io::AsyncWriteExt::write_all(&mut stream, oversized.as_bytes())
            .await
            .unwrap();
        let reply = codec::read_frame(&mut stream).await.unwrap();
        assert_eq!(reply.as_deref(), Some(SENTINEL));
    }

    const MAX_FRAME_LEN_PLUS_ONE: usize = crate::transport::MAX_FRAME_LEN + 1;
}
