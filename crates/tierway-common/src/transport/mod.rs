//! TCP transport: bounded line framing, one-shot client, shared accept loop.

pub mod codec;
pub mod tcp;
pub mod tcp_server;

pub use codec::{read_frame, write_frame, MAX_FRAME_LEN};
pub use tcp::{downstream_budget, TcpTransport, DEFAULT_TIMEOUT};
pub use tcp_server::{AcceptConfig, Inbound, TcpServer};
