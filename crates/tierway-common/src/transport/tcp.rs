//! Client-side TCP transport.
//!
//! Every hop in the fabric opens a fresh connection per request: connect,
//! send one frame, read one frame, close. There is no pooling or reuse. All
//! operations are bounded by the transport timeout so a silent peer can
//! never pin a worker indefinitely.

use std::time::Duration;

use tokio::net::TcpStream;

use crate::protocol::error::{Result, TierwayError};
use crate::transport::codec;

/// Default bound for connect, read and write (5 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Headroom kept between a tier's connection deadline and the budget it
/// grants a downstream exchange.
const DOWNSTREAM_MARGIN: Duration = Duration::from_millis(250);

/// Budget a handler gives its downstream exchange when the surrounding
/// connection is bounded by `request_timeout`.
///
/// Strictly below the connection deadline, so a slow upstream surfaces as
/// a sentinel response instead of the outer timeout dropping the
/// connection with no reply at all.
pub fn downstream_budget(request_timeout: Duration) -> Duration {
    const FLOOR: Duration = Duration::from_millis(50);
    request_timeout.saturating_sub(DOWNSTREAM_MARGIN).max(FLOOR)
}

/// One-shot TCP client used by the balancer, the proxy, the interactive
/// client and the supervisor's stop requests.
#[derive(Debug, Clone, Copy)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        TcpTransport { timeout }
    }

    /// Connects to a remote endpoint, bounded by the transport timeout.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TierwayError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| TierwayError::Connection(format!("Failed to connect to {addr}: {e}")))?;
        Ok(stream)
    }

    /// Sends one frame and waits for the single response frame.
    ///
    /// This is the complete life of a fabric connection: connect, one frame
    /// out, one frame in, close. A peer that closes without responding is a
    /// connection error, not an empty response.
    pub async fn exchange(&self, addr: &str, line: &str) -> Result<String> {
        let mut stream = self.connect(addr).await?;

        tokio::time::timeout(self.timeout, codec::write_frame(&mut stream, line))
            .await
            .map_err(|_| TierwayError::Timeout(self.timeout.as_millis() as u64))??;

        let response = tokio::time::timeout(self.timeout, codec::read_frame(&mut stream))
            .await
            .map_err(|_| TierwayError::Timeout(self.timeout.as_millis() as u64))??;

        response.ok_or_else(|| {
            TierwayError::Connection(format!("{addr} closed the connection without a response"))
        })
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}
