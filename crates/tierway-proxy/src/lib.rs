//! The reverse-proxy tier.
//!
//! A reverse proxy fronts a fixed set of exactly three compute servers. Per
//! connection it reads one request, rejects a negative value with the
//! sentinel without contacting any server, and otherwise relays the request
//! verbatim to one of its servers picked uniformly at random. There is no
//! health awareness, weighting, caching or retry at this tier: a failed
//! downstream exchange degrades to a sentinel response for that one request.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{info, warn};

use tierway_common::protocol::error::{Result, TierwayError};
use tierway_common::protocol::Response;
use tierway_common::topology::{Endpoint, SERVERS_PER_PROXY};
use tierway_common::transport::{downstream_budget, AcceptConfig, TcpServer, TcpTransport, DEFAULT_TIMEOUT};

/// Startup parameters for one reverse proxy.
#[derive(Debug, Clone)]
pub struct ReverseProxyConfig {
    pub id: u16,
    pub port: u16,
    /// The three compute servers this proxy owns.
    pub upstreams: Vec<Endpoint>,
    pub max_connections: usize,
    pub request_timeout: Duration,
}

impl ReverseProxyConfig {
    pub fn new(id: u16, port: u16, upstreams: Vec<Endpoint>) -> Self {
        ReverseProxyConfig {
            id,
            port,
            upstreams,
            max_connections: 30,
            request_timeout: DEFAULT_TIMEOUT,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.upstreams.len() != SERVERS_PER_PROXY {
            return Err(TierwayError::Config(format!(
                "reverse proxy #{} needs exactly {} upstream servers, got {}",
                self.id,
                SERVERS_PER_PROXY,
                self.upstreams.len()
            )));
        }
        Ok(())
    }
}

/// One member of the proxy tier.
pub struct ReverseProxy {
    config: ReverseProxyConfig,
}

impl ReverseProxy {
    pub fn new(config: ReverseProxyConfig) -> Result<Self> {
        config.validate()?;
        Ok(ReverseProxy { config })
    }

    pub async fn bind(self) -> Result<BoundReverseProxy> {
        let accept = AcceptConfig {
            max_connections: self.config.max_connections,
            request_timeout: self.config.request_timeout,
        };
        let listener = TcpServer::bind(&format!("0.0.0.0:{}", self.config.port), accept).await?;
        info!(
            "[REVERSE PROXY #{}] started, listening on port {}",
            self.config.id,
            listener.local_addr()?.port()
        );
        Ok(BoundReverseProxy {
            config: self.config,
            listener,
        })
    }
}

/// A reverse proxy bound to its socket but not yet serving.
pub struct BoundReverseProxy {
    config: ReverseProxyConfig,
    listener: TcpServer,
}

impl BoundReverseProxy {
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, shutdown: watch::Sender<bool>) -> Result<()> {
        let id = self.config.id;
        let upstreams = Arc::new(self.config.upstreams.clone());
        // The exchange deadline sits below the connection deadline so a
        // slow server is answered with the sentinel, not a dropped
        // connection.
        let transport = TcpTransport::with_timeout(downstream_budget(self.config.request_timeout));

        self.listener
            .run_with_handler(
                move |inbound| {
                    let upstreams = upstreams.clone();
                    async move {
                        let request = inbound.request;

                        // Negative values never reach a server.
                        if request.value < 0.0 {
                            info!(
                                "[REVERSE PROXY #{id}] illegal request from caller #{}, returning sentinel",
                                request.caller_id
                            );
                            return Ok(Response::Illegal);
                        }

                        // Uniform random pick from the shared generator; the
                        // selection is the whole load policy at this tier.
                        let index = rand::thread_rng().gen_range(0..upstreams.len());
                        let server = upstreams[index];
                        info!(
                            "[REVERSE PROXY #{id}] request from caller #{}, forwarding to server #{}",
                            request.caller_id, server.id
                        );

                        match transport.exchange(&server.addr(), &inbound.raw).await {
                            Ok(line) => Response::parse(&line),
                            Err(e) => {
                                warn!(
                                    "[REVERSE PROXY #{id}] server #{} unreachable: {e}",
                                    server.id
                                );
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tierway_common::protocol::SENTINEL;
    use tierway_server::{ComputeServer, ComputeServerConfig};

    /// Starts a real compute server on an ephemeral port and returns its
    /// endpoint plus a counter of connections it accepted.
    async fn start_counting_server(id: u16) -> (Endpoint, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let count = counter.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Ok(Some(line)) = tierway_common::transport::read_frame(&mut stream).await {
                        let request = tierway_common::protocol::Request::parse(&line).unwrap();
                        let reply = Response::Value(request.value.sqrt()).to_string();
                        let _ = tierway_common::transport::write_frame(&mut stream, &reply).await;
                    }
                });
            }
        });

        (Endpoint::new(id, port), counter)
    }

    async fn start_proxy(upstreams: Vec<Endpoint>) -> String {
        let bound = ReverseProxy::new(ReverseProxyConfig::new(1, 0, upstreams))
            .unwrap()
            .bind()
            .await
            .unwrap();
        let addr = format!("127.0.0.1:{}", bound.local_addr().unwrap().port());
        let (shutdown, _) = watch::channel(false);
        tokio::spawn(async move { bound.run(shutdown).await });
        addr
    }

    #[tokio::test]
    async fn test_rejects_wrong_upstream_count() {
        let config = ReverseProxyConfig::new(1, 0, vec![Endpoint::new(1, 9093)]);
        assert!(ReverseProxy::new(config).is_err());
    }

    #[tokio::test]
    async fn test_forwards_valid_request() {
        let (s1, _) = start_counting_server(1).await;
        let (s2, _) = start_counting_server(2).await;
        let (s3, _) = start_counting_server(3).await;
        let addr = start_proxy(vec![s1, s2, s3]).await;

        let response = TcpTransport::new().exchange(&addr, "7 16.0").await.unwrap();
        assert_eq!(response, "4.00");
    }

    #[tokio::test]
    async fn test_negative_value_short_circuits() {
        let (s1, c1) = start_counting_server(1).await;
        let (s2, c2) = start_counting_server(2).await;
        let (s3, c3) = start_counting_server(3).await;
        let addr = start_proxy(vec![s1, s2, s3]).await;

        let response = TcpTransport::new().exchange(&addr, "4 -2.5").await.unwrap();
        assert_eq!(response, SENTINEL);

        // No server may have been contacted.
        assert_eq!(c1.load(Ordering::SeqCst), 0);
        assert_eq!(c2.load(Ordering::SeqCst), 0);
        assert_eq!(c3.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_selection_spreads_over_all_servers() {
        let (s1, c1) = start_counting_server(1).await;
        let (s2, c2) = start_counting_server(2).await;
        let (s3, c3) = start_counting_server(3).await;
        let addr = start_proxy(vec![s1, s2, s3]).await;

        for _ in 0..90 {
            let response = TcpTransport::new().exchange(&addr, "1 4.0").await.unwrap();
            assert_eq!(response, "2.00");
        }

        // Statistical, not exact: each of the three servers must have seen
        // a reasonable share of 90 uniform picks.
        for counter in [&c1, &c2, &c3] {
            let seen = counter.load(Ordering::SeqCst);
            assert!(seen >= 10, "server saw only {seen} of 90 requests");
        }
        assert_eq!(
            c1.load(Ordering::SeqCst) + c2.load(Ordering::SeqCst) + c3.load(Ordering::SeqCst),
            90
        );
    }

    #[tokio::test]
    async fn test_dead_server_degrades_to_sentinel() {
        // Three endpoints nothing listens on.
        let dead = |id| async move {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = l.local_addr().unwrap().port();
            drop(l);
            Endpoint::new(id, port)
        };
        let upstreams = vec![dead(1).await, dead(2).await, dead(3).await];

        let bound = ReverseProxy::new(ReverseProxyConfig {
            request_timeout: Duration::from_millis(300),
            ..ReverseProxyConfig::new(1, 0, upstreams)
        })
        .unwrap()
        .bind()
        .await
        .unwrap();
        let addr = format!("127.0.0.1:{}", bound.local_addr().unwrap().port());
        let (shutdown, _) = watch::channel(false);
        tokio::spawn(async move { bound.run(shutdown).await });

        // The proxy must answer with the sentinel, not die.
        let response = TcpTransport::new().exchange(&addr, "7 16.0").await.unwrap();
        assert_eq!(response, SENTINEL);
        let response = TcpTransport::new().exchange(&addr, "7 16.0").await.unwrap();
        assert_eq!(response, SENTINEL);
    }

    #[tokio::test]
    async fn test_silent_server_yields_sentinel_not_eof() {
        // An upstream that accepts connections and then never replies.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                held.push(stream);
            }
        });

        let upstreams = vec![
            Endpoint::new(1, port),
            Endpoint::new(2, port),
            Endpoint::new(3, port),
        ];
        let bound = ReverseProxy::new(ReverseProxyConfig {
            request_timeout: Duration::from_millis(500),
            ..ReverseProxyConfig::new(1, 0, upstreams)
        })
        .unwrap()
        .bind()
        .await
        .unwrap();
        let addr = format!("127.0.0.1:{}", bound.local_addr().unwrap().port());
        let (shutdown, _) = watch::channel(false);
        tokio::spawn(async move { bound.run(shutdown).await });

        // The client outlives the proxy's own deadline: the reply must be
        // the sentinel, never a connection dropped without a response.
        let response = TcpTransport::with_timeout(Duration::from_secs(3))
            .exchange(&addr, "7 16.0")
            .await
            .unwrap();
        assert_eq!(response, SENTINEL);
    }

    #[tokio::test]
    async fn test_forwards_end_to_end_with_real_server() {
        let bound = ComputeServer::new(ComputeServerConfig::new(5, 0)).bind().await.unwrap();
        let server_ep = Endpoint::new(5, bound.local_addr().unwrap().port());
        let (shutdown, _) = watch::channel(false);
        tokio::spawn(async move { bound.run(shutdown).await });

        let addr = start_proxy(vec![server_ep, server_ep, server_ep]).await;
        let response = TcpTransport::new().exchange(&addr, "3 10.0").await.unwrap();
        assert_eq!(response, "3.16");
    }
}
