//! The load-balancer tier: the fabric's entry point.
//!
//! The balancer fronts a fixed ordered pair of reverse proxies. Routing is
//! deterministic and keyed purely on the caller id; the policy is a trait so
//! the parity placeholder can be swapped without touching the relay path.
//! One fresh connection per request, verbatim forward, relay back, close.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use tierway_common::protocol::error::{Result, TierwayError};
use tierway_common::protocol::Response;
use tierway_common::topology::{Endpoint, PROXY_COUNT};
use tierway_common::transport::{downstream_budget, AcceptConfig, TcpServer, TcpTransport, DEFAULT_TIMEOUT};

/// Picks a backend index for a caller.
///
/// Implementations must be deterministic: the same caller id against the
/// same backend count always routes the same way.
pub trait RoutePolicy: Send + Sync + 'static {
    fn route(&self, caller_id: i64, backends: usize) -> usize;
}

/// The default policy: even caller ids go to index 1, odd to index 0.
///
/// A placeholder routing strategy, kept for wire-compatible behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParityPolicy;

impl RoutePolicy for ParityPolicy {
    fn route(&self, caller_id: i64, backends: usize) -> usize {
        let index = if caller_id % 2 == 0 { 1 } else { 0 };
        index.min(backends.saturating_sub(1))
    }
}

/// Startup parameters for the load balancer.
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    pub port: u16,
    /// The two reverse proxies, in routing order.
    pub proxies: Vec<Endpoint>,
    pub max_connections: usize,
    pub request_timeout: Duration,
}

impl LoadBalancerConfig {
    pub fn new(port: u16, proxies: Vec<Endpoint>) -> Self {
        LoadBalancerConfig {
            port,
            proxies,
            max_connections: 60,
            request_timeout: DEFAULT_TIMEOUT,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.proxies.len() != PROXY_COUNT {
            return Err(TierwayError::Config(format!(
                "load balancer needs exactly {} proxies, got {}",
                PROXY_COUNT,
                self.proxies.len()
            )));
        }
        Ok(())
    }
}

/// The single load balancer of the fabric.
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    policy: Arc<dyn RoutePolicy>,
}

impl LoadBalancer {
    /// Creates a balancer with the default parity policy.
    pub fn new(config: LoadBalancerConfig) -> Result<Self> {
        Self::with_policy(config, ParityPolicy)
    }

    pub fn with_policy(config: LoadBalancerConfig, policy: impl RoutePolicy) -> Result<Self> {
        config.validate()?;
        Ok(LoadBalancer {
            config,
            policy: Arc::new(policy),
        })
    }

    pub async fn bind(self) -> Result<BoundLoadBalancer> {
        let accept = AcceptConfig {
            max_connections: self.config.max_connections,
            request_timeout: self.config.request_timeout,
        };
        let listener = TcpServer::bind(&format!("0.0.0.0:{}", self.config.port), accept).await?;
        info!(
            "[LOAD BALANCER] started, listening on port {}",
            listener.local_addr()?.port()
        );
        Ok(BoundLoadBalancer {
            config: self.config,
            policy: self.policy,
            listener,
        })
    }
}

/// A load balancer bound to its socket but not yet serving.
pub struct BoundLoadBalancer {
    config: LoadBalancerConfig,
    policy: Arc<dyn RoutePolicy>,
    listener: TcpServer,
}

impl BoundLoadBalancer {
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, shutdown: watch::Sender<bool>) -> Result<()> {
        let proxies = Arc::new(self.config.proxies.clone());
        let policy = self.policy;
        let transport = TcpTransport::with_timeout(downstream_budget(self.config.request_timeout));

        self.listener
            .run_with_handler(
                move |inbound| {
                    let proxies = proxies.clone();
                    let policy = policy.clone();
                    async move {
                        let request = inbound.request;
                        let index = policy.route(request.caller_id, proxies.len());
                        let proxy = proxies[index];
                        info!(
                            "[LOAD BALANCER] request from caller #{}, forwarding to proxy #{}",
                            request.caller_id, proxy.id
                        );

                        match transport.exchange(&proxy.addr(), &inbound.raw).await {
                            Ok(line) => Response::parse(&line),
                            Err(e) => {
                                warn!("[LOAD BALANCER] proxy #{} unreachable: {e}", proxy.id);
                                Ok(Response::Illegal)
                            }
                        }
                    }
                },
                shutdown,
            )
            .await
    }
}
