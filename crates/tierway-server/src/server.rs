use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use tierway_common::protocol::error::Result;
use tierway_common::protocol::Response;
use tierway_common::transport::{AcceptConfig, TcpServer, DEFAULT_TIMEOUT};

use crate::compute::{Sqrt, Workload};

/// Startup parameters for one compute server.
#[derive(Debug, Clone)]
pub struct ComputeServerConfig {
    /// Logical id, stable across respawns.
    pub id: u16,
    /// Listening port. Port 0 binds an ephemeral port (tests).
    pub port: u16,
    /// Admission depth for concurrent connections.
    pub max_connections: usize,
    pub request_timeout: Duration,
}

impl ComputeServerConfig {
    pub fn new(id: u16, port: u16) -> Self {
        ComputeServerConfig {
            id,
            port,
            max_connections: 10,
            request_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// One member of the compute tier.
pub struct ComputeServer {
    config: ComputeServerConfig,
    workload: Arc<dyn Workload>,
}

impl ComputeServer {
    /// Creates a server with the default sqrt workload.
    pub fn new(config: ComputeServerConfig) -> Self {
        Self::with_workload(config, Sqrt)
    }

    pub fn with_workload(config: ComputeServerConfig, workload: impl Workload) -> Self {
        ComputeServer {
            config,
            workload: Arc::new(workload),
        }
    }

    /// Binds the listening socket. Bind failure is fatal by contract.
    pub async fn bind(self) -> Result<BoundComputeServer> {
        let accept = AcceptConfig {
            max_connections: self.config.max_connections,
            request_timeout: self.config.request_timeout,
        };
        let listener = TcpServer::bind(&format!("0.0.0.0:{}", self.config.port), accept).await?;
        info!(
            "[SERVER #{}] started, listening on port {}",
            self.config.id,
            listener.local_addr()?.port()
        );
        Ok(BoundComputeServer {
            config: self.config,
            workload: self.workload,
            listener,
        })
    }
}

/// A compute server whose socket is bound but whose accept loop has not
/// started yet. Splitting bind from run lets tests bind port 0 and read the
/// assigned port before serving.
pub struct BoundComputeServer {
    config: ComputeServerConfig,
    workload: Arc<dyn Workload>,
    listener: TcpServer,
}

impl BoundComputeServer {
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until the shutdown channel flips (stop line or signal).
    pub async fn run(self, shutdown: watch::Sender<bool>) -> Result<()> {
        let id = self.config.id;
        let workload = self.workload;
        self.listener
            .run_with_handler(
                move |inbound| {
                    let workload = workload.clone();
                    async move {
                        let request = inbound.request;
                        let result = workload.apply(request.value);
                        info!(
                            "[SERVER #{id}] received {:.2} from caller #{}, returning {result:.2}",
                            request.value, request.caller_id
                        );
                        Ok(Response::Value(result))
                    }
                },
                shutdown,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierway_common::transport::TcpTransport;
    use tierway_common::protocol::{SENTINEL, STOP_ACK, STOP_COMMAND};

    async fn start_server() -> (String, tokio::task::JoinHandle<Result<()>>) {
        let bound = ComputeServer::new(ComputeServerConfig::new(1, 0))
            .bind()
            .await
            .unwrap();
        let addr = format!("127.0.0.1:{}", bound.local_addr().unwrap().port());
        let (shutdown, _) = watch::channel(false);
        let handle = tokio::spawn(async move { bound.run(shutdown).await });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_serves_square_root() {
        let (addr, _handle) = start_server().await;
        let response = TcpTransport::new().exchange(&addr, "7 16.0").await.unwrap();
        assert_eq!(response, "4.00");
    }

    #[tokio::test]
    async fn test_two_decimal_rounding() {
        let (addr, _handle) = start_server().await;
        let response = TcpTransport::new().exchange(&addr, "3 10.0").await.unwrap();
        assert_eq!(response, "3.16");
    }

    #[tokio::test]
    async fn test_malformed_request_is_answered_not_fatal() {
        let (addr, _handle) = start_server().await;
        let response = TcpTransport::new().exchange(&addr, "garbage").await.unwrap();
        assert_eq!(response, SENTINEL);

        // The server must still be serving afterwards.
        let response = TcpTransport::new().exchange(&addr, "7 16.0").await.unwrap();
        assert_eq!(response, "4.00");
    }

    #[tokio::test]
    async fn test_connections_are_independent() {
        let (addr, _handle) = start_server().await;
        for value in ["1 1.0", "2 4.0", "3 9.0"] {
            let _ = TcpTransport::new().exchange(&addr, value).await.unwrap();
        }
        let response = TcpTransport::new().exchange(&addr, "9 25.0").await.unwrap();
        assert_eq!(response, "5.00");
    }

    #[tokio::test]
    async fn test_stop_exits_cleanly() {
        let (addr, handle) = start_server().await;
        let ack = TcpTransport::new().exchange(&addr, STOP_COMMAND).await.unwrap();
        assert_eq!(ack, STOP_ACK);
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_custom_workload() {
        struct Double;
        impl Workload for Double {
            fn apply(&self, value: f64) -> f64 {
                value * 2.0
            }
        }

        let bound = ComputeServer::with_workload(ComputeServerConfig::new(2, 0), Double)
            .bind()
            .await
            .unwrap();
        let addr = format!("127.0.0.1:{}", bound.local_addr().unwrap().port());
        let (shutdown, _) = watch::channel(false);
        tokio::spawn(async move { bound.run(shutdown).await });

        let response = TcpTransport::new().exchange(&addr, "1 21.0").await.unwrap();
        assert_eq!(response, "42.00");
    }
}
