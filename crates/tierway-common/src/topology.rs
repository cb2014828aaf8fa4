//! The static fabric topology.
//!
//! The topology is fixed: one load balancer, exactly two reverse proxies and
//! exactly six compute servers, partitioned three-per-proxy. It is built once
//! at startup and passed to each component explicitly; nothing mutates it
//! afterwards.

use serde::{Deserialize, Serialize};

use crate::protocol::error::{Result, TierwayError};

/// Number of reverse proxies fronted by the load balancer.
pub const PROXY_COUNT: usize = 2;
/// Number of compute servers assigned to each reverse proxy.
pub const SERVERS_PER_PROXY: usize = 3;
/// Total number of compute servers.
pub const SERVER_COUNT: usize = PROXY_COUNT * SERVERS_PER_PROXY;

/// A logical role within the fabric, identified by its tier and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Balancer,
    Proxy(u16),
    Server(u16),
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Balancer => write!(f, "load balancer"),
            Role::Proxy(id) => write!(f, "reverse proxy #{id}"),
            Role::Server(id) => write!(f, "server #{id}"),
        }
    }
}

/// A peer endpoint: logical id plus listening port, always on localhost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: u16,
    pub port: u16,
}

impl Endpoint {
    pub fn new(id: u16, port: u16) -> Self {
        Endpoint { id, port }
    }

    /// Connectable address for this endpoint.
    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

impl std::str::FromStr for Endpoint {
    type Err = TierwayError;

    /// Parses the `"<id>:<port>"` form used on the command line.
    fn from_str(s: &str) -> Result<Self> {
        let (id, port) = s
            .split_once(':')
            .ok_or_else(|| TierwayError::Config(format!("expected '<id>:<port>', got '{s}'")))?;
        let id = id
            .parse()
            .map_err(|e| TierwayError::Config(format!("invalid endpoint id '{id}': {e}")))?;
        let port = port
            .parse()
            .map_err(|e| TierwayError::Config(format!("invalid endpoint port '{port}': {e}")))?;
        Ok(Endpoint { id, port })
    }
}

/// The full fabric layout the supervisor spawns and monitors.
///
/// Invariants, checked by [`Topology::new`]:
/// - exactly [`PROXY_COUNT`] proxies and [`SERVER_COUNT`] servers,
/// - all listening ports distinct,
/// - proxy ids and server ids distinct within their tier.
///
/// The server partition is positional: proxy at index `i` owns the servers
/// at indices `3i..3i+3`, so the partition is fixed and non-overlapping by
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    balancer_port: u16,
    proxies: Vec<Endpoint>,
    servers: Vec<Endpoint>,
}

impl Topology {
    pub fn new(balancer_port: u16, proxies: Vec<Endpoint>, servers: Vec<Endpoint>) -> Result<Self> {
        if proxies.len() != PROXY_COUNT {
            return Err(TierwayError::Config(format!(
                "expected {} proxies, got {}",
                PROXY_COUNT,
                proxies.len()
            )));
        }
        if servers.len() != SERVER_COUNT {
            return Err(TierwayError::Config(format!(
                "expected {} servers, got {}",
                SERVER_COUNT,
                servers.len()
            )));
        }

        let mut ports: Vec<u16> = proxies
            .iter()
            .chain(servers.iter())
            .map(|e| e.port)
            .chain(std::iter::once(balancer_port))
            .collect();
        ports.sort_unstable();
        ports.dedup();
        if ports.len() != PROXY_COUNT + SERVER_COUNT + 1 {
            return Err(TierwayError::Config("duplicate listening port in topology".into()));
        }

        let mut proxy_ids: Vec<u16> = proxies.iter().map(|e| e.id).collect();
        proxy_ids.sort_unstable();
        proxy_ids.dedup();
        let mut server_ids: Vec<u16> = servers.iter().map(|e| e.id).collect();
        server_ids.sort_unstable();
        server_ids.dedup();
        if proxy_ids.len() != PROXY_COUNT || server_ids.len() != SERVER_COUNT {
            return Err(TierwayError::Config("duplicate id within a tier".into()));
        }

        Ok(Topology {
            balancer_port,
            proxies,
            servers,
        })
    }

    /// The port the load balancer listens on.
    pub fn balancer_port(&self) -> u16 {
        self.balancer_port
    }

    /// The proxy endpoints in routing order.
    pub fn proxies(&self) -> &[Endpoint] {
        &self.proxies
    }

    /// All server endpoints, in partition order.
    pub fn servers(&self) -> &[Endpoint] {
        &self.servers
    }

    /// The three servers assigned to the proxy at `proxy_index`.
    pub fn servers_for_proxy(&self, proxy_index: usize) -> &[Endpoint] {
        let start = proxy_index * SERVERS_PER_PROXY;
        &self.servers[start..start + SERVERS_PER_PROXY]
    }

    /// Every role in the fabric, in spawn order: balancer, proxies, servers.
    pub fn roles(&self) -> Vec<Role> {
        let mut roles = vec![Role::Balancer];
        roles.extend(self.proxies.iter().map(|p| Role::Proxy(p.id)));
        roles.extend(self.servers.iter().map(|s| Role::Server(s.id)));
        roles
    }

    /// The endpoint for a role, if the role exists in this topology.
    pub fn endpoint(&self, role: Role) -> Option<Endpoint> {
        match role {
            Role::Balancer => Some(Endpoint::new(0, self.balancer_port)),
            Role::Proxy(id) => self.proxies.iter().copied().find(|p| p.id == id),
            Role::Server(id) => self.servers.iter().copied().find(|s| s.id == id),
        }
    }
}

impl Default for Topology {
    /// The fixed localhost layout: balancer on 9090, proxies 1-2 on
    /// 9091-9092, servers 1-6 on 9093-9098.
    fn default() -> Self {
        Topology {
            balancer_port: 9090,
            proxies: vec![Endpoint::new(1, 9091), Endpoint::new(2, 9092)],
            servers: (0..SERVER_COUNT as u16)
                .map(|i| Endpoint::new(i + 1, 9093 + i))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let topo = Topology::default();
        assert_eq!(topo.balancer_port(), 9090);
        assert_eq!(topo.proxies().len(), 2);
        assert_eq!(topo.servers().len(), 6);
        assert_eq!(topo.proxies()[0], Endpoint::new(1, 9091));
        assert_eq!(topo.servers()[5], Endpoint::new(6, 9098));
    }

    #[test]
    fn test_partition_is_disjoint_and_exhaustive() {
        let topo = Topology::default();
        let first = topo.servers_for_proxy(0);
        let second = topo.servers_for_proxy(1);
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        for s in first {
            assert!(!second.contains(s));
        }
        let mut all: Vec<_> = first.iter().chain(second.iter()).collect();
        all.sort_by_key(|e| e.id);
        assert_eq!(all.len(), 6);
    }

    #[test]
    fn test_roles_spawn_order() {
        let topo = Topology::default();
        let roles = topo.roles();
        assert_eq!(roles[0], Role::Balancer);
        assert_eq!(roles[1], Role::Proxy(1));
        assert_eq!(roles[2], Role::Proxy(2));
        assert_eq!(roles[3], Role::Server(1));
        assert_eq!(roles.len(), 9);
    }

    #[test]
    fn test_endpoint_lookup() {
        let topo = Topology::default();
        assert_eq!(topo.endpoint(Role::Server(4)).unwrap().port, 9096);
        assert_eq!(topo.endpoint(Role::Proxy(2)).unwrap().port, 9092);
        assert!(topo.endpoint(Role::Server(7)).is_none());
    }

    #[test]
    fn test_rejects_wrong_shape() {
        let result = Topology::new(9090, vec![Endpoint::new(1, 9091)], Topology::default().servers().to_vec());
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_duplicate_port() {
        let mut servers = Topology::default().servers().to_vec();
        servers[1].port = servers[0].port;
        let result = Topology::new(9090, Topology::default().proxies().to_vec(), servers);
        assert!(result.is_err());
    }

    #[test]
    fn test_endpoint_from_str() {
        let ep: Endpoint = "3:9095".parse().unwrap();
        assert_eq!(ep, Endpoint::new(3, 9095));
        assert!("3".parse::<Endpoint>().is_err());
        assert!("a:b".parse::<Endpoint>().is_err());
    }
}
