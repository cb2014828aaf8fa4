//! The supervision core: spawn, monitor, respawn, cascade.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use tierway_common::protocol::error::{Result, TierwayError};
use tierway_common::protocol::{STOP_ACK, STOP_COMMAND};
use tierway_common::topology::{Role, Topology};
use tierway_common::transport::TcpTransport;

use crate::config::{SupervisorConfig, TierLimits};
use crate::record::{ExitEvent, ExitKind, ProcessRecord};

/// Exit-event queue depth; generously above the member count.
const EXIT_CHANNEL_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    ShuttingDown,
    Terminated,
}

/// Command-line arguments for relaunching the fabric binary as `role`.
pub fn role_args(topology: &Topology, limits: &TierLimits, role: Role) -> Result<Vec<String>> {
    let endpoint = topology
        .endpoint(role)
        .ok_or_else(|| TierwayError::Supervision(format!("{role} is not in the topology")))?;

    let mut args = match role {
        Role::Balancer => {
            let mut args = vec!["balancer".into(), "--port".into(), endpoint.port.to_string()];
            for proxy in topology.proxies() {
                args.push("--proxy".into());
                args.push(format!("{}:{}", proxy.id, proxy.port));
            }
            args.extend(["--max-connections".into(), limits.balancer_connections.to_string()]);
            args
        }
        Role::Proxy(id) => {
            let index = topology
                .proxies()
                .iter()
                .position(|p| p.id == id)
                .ok_or_else(|| TierwayError::Supervision(format!("{role} is not in the topology")))?;
            let mut args = vec!["proxy".into()];
            args.extend(["--id".into(), id.to_string()]);
            args.extend(["--port".into(), endpoint.port.to_string()]);
            for server in topology.servers_for_proxy(index) {
                args.push("--upstream".into());
                args.push(format!("{}:{}", server.id, server.port));
            }
            args.extend(["--max-connections".into(), limits.proxy_connections.to_string()]);
            args
        }
        Role::Server(id) => {
            let mut args = vec!["server".into()];
            args.extend(["--id".into(), id.to_string()]);
            args.extend(["--port".into(), endpoint.port.to_string()]);
            args.extend(["--max-connections".into(), limits.server_connections.to_string()]);
            args
        }
    };
    args.extend(["--request-timeout-ms".into(), limits.request_timeout_ms.to_string()]);
    Ok(args)
}

/// The shutdown cascade, leaf-first: servers, then proxies, then the
/// balancer. Each inner slice is stopped and reaped before the next starts.
pub fn shutdown_tiers(topology: &Topology) -> [Vec<Role>; 3] {
    [
        topology.servers().iter().map(|s| Role::Server(s.id)).collect(),
        topology.proxies().iter().map(|p| Role::Proxy(p.id)).collect(),
        vec![Role::Balancer],
    ]
}

/// Spawns and supervises the whole fabric.
pub struct Supervisor {
    config: SupervisorConfig,
    command: PathBuf,
    records: HashMap<Role, ProcessRecord>,
    exit_tx: mpsc::Sender<ExitEvent>,
    exit_rx: mpsc::Receiver<ExitEvent>,
    state: State,
}

impl Supervisor {
    /// Supervises children spawned from the currently running binary.
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        let command = std::env::current_exe()
            .map_err(|e| TierwayError::Supervision(format!("cannot locate own binary: {e}")))?;
        Ok(Self::with_command(config, command))
    }

    /// Supervises children spawned from an explicit binary path.
    pub fn with_command(config: SupervisorConfig, command: PathBuf) -> Self {
        let (exit_tx, exit_rx) = mpsc::channel(EXIT_CHANNEL_DEPTH);
        Supervisor {
            config,
            command,
            records: HashMap::new(),
            exit_tx,
            exit_rx,
            state: State::Running,
        }
    }

    /// Runs until the shutdown channel flips or every member has retired,
    /// then drives the cascade.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.start()?;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = self.exit_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_exit(event)?;
                    // A burst of exits can queue up while this task was
                    // elsewhere; drain them all before selecting again.
                    while let Ok(event) = self.exit_rx.try_recv() {
                        self.handle_exit(event)?;
                    }
                    if self.records.is_empty() {
                        info!("[SUPERVISOR] every member has retired");
                        break;
                    }
                }
            }
        }
        self.shutdown().await
    }

    fn start(&mut self) -> Result<()> {
        for role in self.config.topology.roles() {
            self.spawn(role)?;
        }
        info!("[SUPERVISOR] fabric up, {} members", self.records.len());
        Ok(())
    }

    fn spawn(&mut self, role: Role) -> Result<()> {
        let args = role_args(&self.config.topology, &self.config.limits, role)?;
        let mut command = Command::new(&self.command);
        command.args(&args).kill_on_drop(true);
        // Each child gets its own process group: a terminal-generated
        // SIGINT must reach only the supervisor, and the tiers stop in
        // cascade order rather than all at once.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|e| TierwayError::Supervision(format!("failed to spawn {role}: {e}")))?;

        let pid = child.id();
        match pid {
            Some(pid) => info!("[SUPERVISOR] spawned {role} (pid {pid})"),
            None => info!("[SUPERVISOR] spawned {role}"),
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    if let Ok(status) = status {
                        let _ = exit_tx.send(ExitEvent { role, status }).await;
                    }
                }
                _ = kill_rx => {
                    let _ = child.start_kill();
                    if let Ok(status) = child.wait().await {
                        let _ = exit_tx.send(ExitEvent { role, status }).await;
                    }
                }
            }
        });

        self.records.insert(role, ProcessRecord::new(role, pid, kill_tx));
        Ok(())
    }

    fn handle_exit(&mut self, event: ExitEvent) -> Result<()> {
        self.records.remove(&event.role);
        if self.state != State::Running {
            return Ok(());
        }
        match event.kind() {
            ExitKind::Planned => {
                info!("[SUPERVISOR] {} exited cleanly, retiring it", event.role);
            }
            ExitKind::Crashed => {
                warn!("[SUPERVISOR] {} crashed ({}), respawning", event.role, event.status);
                self.spawn(event.role)?;
            }
        }
        Ok(())
    }

    /// Leaf-first cascade: ask each tier to stop over the wire, reap it,
    /// then move one tier up. Members that ignore the request are killed.
    async fn shutdown(&mut self) -> Result<()> {
        if self.state == State::Terminated {
            return Ok(());
        }
        self.state = State::ShuttingDown;
        info!("[SUPERVISOR] shutting down, cascading from the leaves");

        for tier in shutdown_tiers(&self.config.topology) {
            self.stop_tier(&tier).await;
        }

        self.state = State::Terminated;
        info!("[SUPERVISOR] fabric down");
        Ok(())
    }

    async fn stop_tier(&mut self, roles: &[Role]) {
        let transport = TcpTransport::with_timeout(self.config.stop_timeout);
        let mut pending = HashSet::new();

        for role in roles {
            if !self.records.contains_key(role) {
                continue;
            }
            pending.insert(*role);
            let Some(endpoint) = self.config.topology.endpoint(*role) else {
                continue;
            };
            match transport.exchange(&endpoint.addr(), STOP_COMMAND).await {
                Ok(ack) if ack == STOP_ACK => {
                    info!("[SUPERVISOR] {role} acknowledged stop");
                }
                Ok(other) => {
                    warn!("[SUPERVISOR] {role} answered stop with '{other}', killing it");
                    self.kill(*role);
                }
                Err(e) => {
                    warn!("[SUPERVISOR] {role} unreachable for stop ({e}), killing it");
                    self.kill(*role);
                }
            }
        }

        self.reap(pending).await;
    }

    /// Waits for the given members to exit, killing any that outlive the
    /// stop timeout.
    async fn reap(&mut self, mut pending: HashSet<Role>) {
        let deadline = tokio::time::Instant::now() + self.config.stop_timeout;
        while !pending.is_empty() {
            match tokio::time::timeout_at(deadline, self.exit_rx.recv()).await {
                Ok(Some(event)) => {
                    pending.remove(&event.role);
                    self.records.remove(&event.role);
                }
                Ok(None) => return,
                Err(_) => break,
            }
        }

        if pending.is_empty() {
            return;
        }
        for role in pending.iter() {
            warn!("[SUPERVISOR] {role} did not stop in time, killing it");
        }
        let stragglers: Vec<Role> = pending.iter().copied().collect();
        for role in stragglers {
            self.kill(role);
        }

        let grace = tokio::time::Instant::now() + Duration::from_secs(1);
        while !pending.is_empty() {
            match tokio::time::timeout_at(grace, self.exit_rx.recv()).await {
                Ok(Some(event)) => {
                    pending.remove(&event.role);
                    self.records.remove(&event.role);
                }
                _ => return,
            }
        }
    }

    fn kill(&mut self, role: Role) {
        if let Some(record) = self.records.get_mut(&role) {
            match record.pid {
                Some(pid) => debug!("[SUPERVISOR] killing {} (pid {pid})", record.role),
                None => debug!("[SUPERVISOR] killing {}", record.role),
            }
            record.kill();
        }
    }
}
