//! Supervisor configuration.
//!
//! The defaults describe the fixed localhost fabric. A TOML file can
//! override any part of the layout; fields left out keep their defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use tierway_common::protocol::error::{Result, TierwayError};
use tierway_common::topology::{Endpoint, Topology};

/// How long to wait for a member to honor a stop request before killing it.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-tier admission depths and the request timeout handed to every child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub balancer_connections: usize,
    pub proxy_connections: usize,
    pub server_connections: usize,
    pub request_timeout_ms: u64,
}

impl Default for TierLimits {
    fn default() -> Self {
        TierLimits {
            balancer_connections: 60,
            proxy_connections: 30,
            server_connections: 10,
            request_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub topology: Topology,
    pub limits: TierLimits,
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            topology: Topology::default(),
            limits: TierLimits::default(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// On-disk shape of the config file. Every field is optional.
#[derive(Debug, Deserialize)]
struct FileConfig {
    balancer_port: Option<u16>,
    proxies: Option<Vec<Endpoint>>,
    servers: Option<Vec<Endpoint>>,
    balancer_connections: Option<usize>,
    proxy_connections: Option<usize>,
    server_connections: Option<usize>,
    request_timeout_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
}

impl SupervisorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(contents)
            .map_err(|e| TierwayError::Config(format!("invalid config file: {e}")))?;

        let defaults = Topology::default();
        let topology = Topology::new(
            file.balancer_port.unwrap_or_else(|| defaults.balancer_port()),
            file.proxies.unwrap_or_else(|| defaults.proxies().to_vec()),
            file.servers.unwrap_or_else(|| defaults.servers().to_vec()),
        )?;

        let default_limits = TierLimits::default();
        let limits = TierLimits {
            balancer_connections: file.balancer_connections.unwrap_or(default_limits.balancer_connections),
            proxy_connections: file.proxy_connections.unwrap_or(default_limits.proxy_connections),
            server_connections: file.server_connections.unwrap_or(default_limits.server_connections),
            request_timeout_ms: file.request_timeout_ms.unwrap_or(default_limits.request_timeout_ms),
        };

        Ok(SupervisorConfig {
            topology,
            limits,
            stop_timeout: file
                .stop_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_STOP_TIMEOUT),
        })
    }
}
