//! Bookkeeping for supervised child processes.

use std::process::ExitStatus;

use tokio::sync::oneshot;

use tierway_common::topology::Role;

/// Why a child exited, as far as respawn policy is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit code 0: the member honored a stop request and retired.
    Planned,
    /// Non-zero exit or killed by a signal.
    Crashed,
}

impl ExitKind {
    pub fn classify(status: ExitStatus) -> Self {
        if status.success() {
            ExitKind::Planned
        } else {
            ExitKind::Crashed
        }
    }
}

/// An exit observed by a monitor task.
#[derive(Debug)]
pub struct ExitEvent {
    pub role: Role,
    pub status: ExitStatus,
}

impl ExitEvent {
    pub fn kind(&self) -> ExitKind {
        ExitKind::classify(self.status)
    }
}

/// One live child under supervision.
///
/// The kill sender is consumed by use: firing it tells the monitor task to
/// forcibly terminate the child, which then reports through the normal exit
/// channel.
#[derive(Debug)]
pub struct ProcessRecord {
    pub role: Role,
    pub pid: Option<u32>,
    pub kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessRecord {
    pub fn new(role: Role, pid: Option<u32>, kill_tx: oneshot::Sender<()>) -> Self {
        ProcessRecord {
            role,
            pid,
            kill_tx: Some(kill_tx),
        }
    }

    /// Asks the monitor task to kill the child. A second call is a no-op.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}
