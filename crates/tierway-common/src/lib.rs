//! Tierway Common Types and Transport
//!
//! This crate provides the protocol definitions, TCP transport layer and the
//! static topology model shared by every tier of the tierway fabric.
//!
//! # Overview
//!
//! Tierway is a three-tier request-processing fabric: requests enter at a
//! load balancer, pass through a reverse proxy and are served by a compute
//! server, with a supervisor owning the lifecycle of all three tiers. This
//! crate contains the pieces every tier needs:
//!
//! - **Protocol Layer**: request/response text format, the illegal-request
//!   sentinel, the `stop` control line and error types
//! - **Transport Layer**: newline-delimited framing with a hard 80-byte cap,
//!   a one-shot TCP client and the shared accept loop
//! - **Topology**: the fixed 1 balancer / 2 proxies / 6 servers layout
//!
//! # Wire Format
//!
//! One message per connection, newline-terminated, at most
//! [`transport::MAX_FRAME_LEN`] bytes of payload:
//!
//! ```text
//! request:  "<caller_id> <value>"
//! response: "<result formatted to two decimals>" | "-1"
//! ```

pub mod protocol;
pub mod topology;
pub mod transport;

pub use protocol::*;
pub use topology::{Endpoint, Role, Topology};
