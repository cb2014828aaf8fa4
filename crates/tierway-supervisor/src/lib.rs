//! Process supervision for the fabric.
//!
//! The supervisor spawns every member of the topology as a child process,
//! watches for exits, respawns crashed members under the same role, and
//! drives the leaf-first shutdown cascade: servers, then proxies, then the
//! load balancer. A member that exits cleanly after a stop request is
//! considered retired and is not respawned.

pub mod config;
pub mod record;
pub mod supervisor;

pub use config::{SupervisorConfig, TierLimits};
pub use record::{ExitEvent, ExitKind};
pub use supervisor::Supervisor;
