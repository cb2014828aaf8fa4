//! # Tierway CLI Entry Point
//!
//! One binary, five modes. The supervisor relaunches this same binary with
//! the tier subcommands, so the whole fabric ships as a single executable.
//!
//! ## Usage
//!
//! ```bash
//! # Spawn and supervise the whole fabric on the default ports
//! tierway supervisor
//!
//! # Same, with a topology override
//! tierway supervisor -c fabric.toml
//!
//! # Start individual members by hand
//! tierway balancer --port 9090 --proxy 1:9091 --proxy 2:9092
//! tierway proxy --id 1 --port 9091 --upstream 1:9093 --upstream 2:9094 --upstream 3:9095
//! tierway server --id 1 --port 9093
//!
//! # Send one request through the balancer (prints the raw reply line)
//! tierway request 7 16.0
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use tokio::sync::watch;

use tierway_balancer::{LoadBalancer, LoadBalancerConfig};
use tierway_common::protocol::Request;
use tierway_common::topology::Endpoint;
use tierway_common::transport::TcpTransport;
use tierway_proxy::{ReverseProxy, ReverseProxyConfig};
use tierway_server::{ComputeServer, ComputeServerConfig};
use tierway_supervisor::{Supervisor, SupervisorConfig};

#[derive(FromArgs)]
/// tierway - a three-tier request fabric
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Supervisor(SupervisorArgs),
    Balancer(BalancerArgs),
    Proxy(ProxyArgs),
    Server(ServerArgs),
    Request(RequestArgs),
}

/// Arguments for the supervisor, which spawns and watches the whole fabric.
#[derive(FromArgs)]
#[argh(subcommand, name = "supervisor")]
/// spawn and supervise the whole fabric
struct SupervisorArgs {
    /// optional TOML file overriding the default topology
    #[argh(option, short = 'c', long = "config")]
    config: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "balancer")]
/// start the load balancer
struct BalancerArgs {
    /// port to listen on
    #[argh(option, default = "9090")]
    port: u16,

    /// proxy endpoint as <id>:<port>, given once per proxy in routing order
    #[argh(option, long = "proxy")]
    proxies: Vec<String>,

    /// maximum concurrent connections
    #[argh(option, long = "max-connections", default = "60")]
    max_connections: usize,

    /// per-request timeout in milliseconds
    #[argh(option, long = "request-timeout-ms", default = "5000")]
    request_timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "proxy")]
/// start a reverse proxy
struct ProxyArgs {
    /// logical id of this proxy
    #[argh(option)]
    id: u16,

    /// port to listen on
    #[argh(option)]
    port: u16,

    /// upstream server endpoint as <id>:<port>, given once per server
    #[argh(option, long = "upstream")]
    upstreams: Vec<String>,

    /// maximum concurrent connections
    #[argh(option, long = "max-connections", default = "30")]
    max_connections: usize,

    /// per-request timeout in milliseconds
    #[argh(option, long = "request-timeout-ms", default = "5000")]
    request_timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "server")]
/// start a compute server
struct ServerArgs {
    /// logical id of this server
    #[argh(option)]
    id: u16,

    /// port to listen on
    #[argh(option)]
    port: u16,

    /// maximum concurrent connections
    #[argh(option, long = "max-connections", default = "10")]
    max_connections: usize,

    /// per-request timeout in milliseconds
    #[argh(option, long = "request-timeout-ms", default = "5000")]
    request_timeout_ms: u64,
}

/// Arguments for sending one request through the fabric.
///
/// Prints the raw reply line to stdout and nothing else, so the output can
/// be piped into other tools.
#[derive(FromArgs)]
#[argh(subcommand, name = "request")]
/// send one request and print the reply
struct RequestArgs {
    /// caller id (routing key)
    #[argh(positional)]
    caller_id: i64,

    /// value to compute the square root of
    #[argh(positional)]
    value: f64,

    /// address of the load balancer
    #[argh(option, default = "\"127.0.0.1:9090\".into()")]
    addr: String,

    /// timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "5000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // No tracing for `request`: its stdout is the reply line, nothing else.
    if !matches!(cli.command, Commands::Request(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Supervisor(args) => run_supervisor(args).await,
        Commands::Balancer(args) => run_balancer(args).await,
        Commands::Proxy(args) => run_proxy(args).await,
        Commands::Server(args) => run_server(args).await,
        Commands::Request(args) => run_request(args).await,
    }
}

fn parse_endpoints(values: &[String]) -> Result<Vec<Endpoint>> {
    values
        .iter()
        .map(|v| v.parse::<Endpoint>().map_err(anyhow::Error::from))
        .collect()
}

/// Flips the shutdown channel on SIGINT or SIGTERM.
fn trap_signals(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        if wait_for_signal().await.is_ok() {
            tracing::info!("signal received, shutting down");
            let _ = shutdown.send(true);
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

async fn run_supervisor(args: SupervisorArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => SupervisorConfig::load(Path::new(path))?,
        None => SupervisorConfig::default(),
    };
    let (shutdown, shutdown_rx) = watch::channel(false);
    trap_signals(shutdown);
    Supervisor::new(config)?.run(shutdown_rx).await?;
    Ok(())
}

async fn run_balancer(args: BalancerArgs) -> Result<()> {
    let mut config = LoadBalancerConfig::new(args.port, parse_endpoints(&args.proxies)?);
    config.max_connections = args.max_connections;
    config.request_timeout = Duration::from_millis(args.request_timeout_ms);

    let bound = LoadBalancer::new(config)?.bind().await?;
    let (shutdown, _) = watch::channel(false);
    trap_signals(shutdown.clone());
    bound.run(shutdown).await?;
    Ok(())
}

async fn run_proxy(args: ProxyArgs) -> Result<()> {
    let mut config = ReverseProxyConfig::new(args.id, args.port, parse_endpoints(&args.upstreams)?);
    config.max_connections = args.max_connections;
    config.request_timeout = Duration::from_millis(args.request_timeout_ms);

    let bound = ReverseProxy::new(config)?.bind().await?;
    let (shutdown, _) = watch::channel(false);
    trap_signals(shutdown.clone());
    bound.run(shutdown).await?;
    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let mut config = ComputeServerConfig::new(args.id, args.port);
    config.max_connections = args.max_connections;
    config.request_timeout = Duration::from_millis(args.request_timeout_ms);

    let bound = ComputeServer::new(config).bind().await?;
    let (shutdown, _) = watch::channel(false);
    trap_signals(shutdown.clone());
    bound.run(shutdown).await?;
    Ok(())
}

async fn run_request(args: RequestArgs) -> Result<()> {
    let request = Request {
        caller_id: args.caller_id,
        value: args.value,
    };
    let transport = TcpTransport::with_timeout(Duration::from_millis(args.timeout_ms));
    let response = transport.exchange(&args.addr, &request.to_string()).await?;
    println!("{response}");
    Ok(())
}
