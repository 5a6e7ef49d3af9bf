//! dns44 entry point
//!
//! Wires the components together: address pool → mapping store → DNS proxy
//! and transparent forwarder, then waits for SIGINT/SIGTERM. Routing and
//! firewall configuration for the virtual range is the operator's job; see
//! the `tproxy` module documentation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use dns44::config::{self, AddressRange, DnsProxyConfig, ProxyConfig};
use dns44::dnsproxy::DnsProxy;
use dns44::mapping::SqliteMapping;
use dns44::pool::RandomPool;
use dns44::tproxy::{has_net_admin_capability, is_root, NetDialer, TcpProxy, UdpProxy};

#[derive(Parser, Debug)]
#[command(name = "dns44", version, about = "Domain-name-preserving transparent forwarder")]
struct Cli {
    /// DNS service bind address (TCP and UDP)
    #[arg(long, default_value = config::DEFAULT_DNS_BIND)]
    dns_bind_address: SocketAddr,

    /// Upstream DNS server for queries that are not rewritten
    #[arg(long, default_value = config::DEFAULT_UPSTREAM)]
    dns_upstream: String,

    /// IP address range where all DNS requests are mapped, `start-end` inclusive
    #[arg(long, default_value = config::DEFAULT_IP_RANGE)]
    ip_range: AddressRange,

    /// Transparent proxy service bind address (TCP and UDP)
    #[arg(long, default_value = config::DEFAULT_PROXY_BIND)]
    proxy_bind_address: SocketAddr,

    /// Path to the database directory [default: $HOME/.dns44/db]
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// TTL (seconds) for synthesized responses
    #[arg(long, default_value_t = config::DEFAULT_TTL)]
    ttl: u32,

    /// Dial timeout for connections originated by the proxy (e.g. 10s, 500ms)
    #[arg(long, default_value = "10s", value_parser = config::parse_duration)]
    dial_timeout: Duration,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(default_db_path)
    }
}

fn default_db_path() -> PathBuf {
    let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("."), PathBuf::from);
    home.join(".dns44").join("db")
}

fn init_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };

    // RUST_LOG wins over the flag-selected default.
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hickory_proto=warn".parse().expect("valid directive"))
        .add_directive("tokio=warn".parse().expect("valid directive"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn check_prerequisites() {
    if !is_root() && !has_net_admin_capability() {
        warn!("not running as root and CAP_NET_ADMIN not detected");
        warn!("transparent sockets will fail to set IP_TRANSPARENT");
    }
}

fn ensure_db_dir(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .with_context(|| format!("failed to create database directory {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    info!("dns44 v{}", dns44::VERSION);
    check_prerequisites();

    // Pool and mapping store.
    let pool = Arc::new(
        RandomPool::new(cli.ip_range.start, cli.ip_range.end)
            .context("unable to create IP pool")?,
    );
    let db_path = cli.db_path();
    ensure_db_dir(&db_path)?;
    let mapping = Arc::new(
        SqliteMapping::open(&db_path, pool).context("mapping store init failed")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // DNS front-end.
    let dns_config = DnsProxyConfig {
        listen_addr: cli.dns_bind_address,
        upstream: cli.dns_upstream.clone(),
        ttl: cli.ttl,
    };
    let dns_proxy = DnsProxy::bind(&dns_config, mapping.clone())
        .await
        .context("unable to start DNS server")?;
    let dns_task = tokio::spawn(dns_proxy.run(shutdown_rx.clone()));
    info!(addr = %cli.dns_bind_address, "DNS server started");

    // Transparent forwarder.
    let proxy_config = ProxyConfig {
        listen_addr: cli.proxy_bind_address,
        dial_timeout: cli.dial_timeout,
        ..ProxyConfig::default()
    };
    let dialer = Arc::new(NetDialer);

    let tcp_proxy = TcpProxy::bind(&proxy_config, mapping.clone(), dialer.clone())
        .context("unable to start TCP proxy")?;
    let tcp_task = tokio::spawn(tcp_proxy.run(shutdown_rx.clone()));

    let udp_proxy = Arc::new(UdpProxy::new(&proxy_config, mapping, dialer));
    let udp_listener = udp_proxy
        .bind_listener(&proxy_config)
        .context("unable to start UDP proxy")?;
    let udp_task = tokio::spawn(udp_proxy.run(udp_listener, shutdown_rx));
    info!(addr = %cli.proxy_bind_address, "transparent proxy started");

    // Wait for SIGINT or SIGTERM.
    tokio::select! {
        _ = signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm() => info!("received SIGTERM, shutting down"),
    }

    let _ = shutdown_tx.send(true);

    await_task("dns", dns_task).await;
    await_task("tcp-proxy", tcp_task).await;
    await_task("udp-proxy", udp_task).await;

    info!("shutdown complete");
    Ok(())
}

async fn await_task<E: std::fmt::Display>(
    name: &str,
    task: tokio::task::JoinHandle<Result<(), E>>,
) {
    match tokio::time::timeout(Duration::from_secs(2), task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => error!(task = name, error = %err, "task exited with error"),
        Ok(Err(err)) => error!(task = name, error = %err, "task panicked"),
        Err(_) => warn!(task = name, "task did not stop in time"),
    }
}

async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    sigterm.recv().await;
}
