//! The compute-server tier: the leaf of the fabric.
//!
//! A compute server accepts one request per connection, applies its workload
//! to the value and answers with the result formatted to two decimals. It is
//! stateless across connections and performs no validation of the value's
//! sign; rejecting negative input is the reverse proxy's job.

pub mod compute;
pub mod server;

pub use compute::{Sqrt, Workload};
pub use server::{BoundComputeServer, ComputeServer, ComputeServerConfig};
