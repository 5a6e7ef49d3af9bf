//! Transparent TCP forwarding
//!
//! Accepts TPROXY-redirected connections. Under `IP_TRANSPARENT` the
//! accepted socket's local address is the original destination the client
//! dialed, so reverse lookup needs nothing beyond `(peer IP, local IP)`.
//! On a hit the flow is spliced to a freshly dialed upstream at
//! `(domain, original port)`; each direction propagates EOF as a write-side
//! shutdown of its counterpart.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::dialer::Dialer;
use super::socket::create_tproxy_tcp_socket;
use crate::config::ProxyConfig;
use crate::error::TproxyError;
use crate::mapping::Mapper;
use crate::net::{canonical_ip, client_key};

/// Pause after a transient accept failure
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Listen backlog
const TCP_BACKLOG: i32 = 1024;

/// Transparent TCP proxy half.
pub struct TcpProxy {
    listener: TcpListener,
    mapper: Arc<dyn Mapper>,
    dialer: Arc<dyn Dialer>,
    dial_timeout: Duration,
}

impl TcpProxy {
    /// Create the transparent listener and bind it.
    pub fn bind(
        config: &ProxyConfig,
        mapper: Arc<dyn Mapper>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, TproxyError> {
        let socket = create_tproxy_tcp_socket()?;
        socket
            .bind(&config.listen_addr.into())
            .map_err(|e| TproxyError::bind(config.listen_addr, e.to_string()))?;
        socket
            .listen(TCP_BACKLOG)
            .map_err(|e| TproxyError::socket_option("listen", e.to_string()))?;

        // Safety: the socket is a valid listening socket we exclusively own.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(socket.into_raw_fd()) };
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;

        info!(addr = %config.listen_addr, "transparent TCP listener ready");

        Ok(Self {
            listener,
            mapper,
            dialer,
            dial_timeout: config.dial_timeout,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TproxyError> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Accept loop. Transient failures are retried after a short pause;
    /// anything else ends the loop (cleanly when shutting down).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), TproxyError> {
        loop {
            tokio::select! {
                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => {
                        let original_dst = match stream.local_addr() {
                            Ok(addr) => addr,
                            Err(err) => {
                                warn!(peer = %peer, error = %err, "can't read local address");
                                continue;
                            }
                        };

                        let mapper = Arc::clone(&self.mapper);
                        let dialer = Arc::clone(&self.dialer);
                        let dial_timeout = self.dial_timeout;
                        tokio::spawn(async move {
                            proxy_connection(stream, peer, original_dst, mapper, dialer, dial_timeout)
                                .await;
                        });
                    }
                    Err(err) if is_transient(&err) => {
                        warn!(error = %err, "temporary error while accepting connection");
                        sleep(ACCEPT_RETRY_DELAY).await;
                    }
                    Err(err) => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                        warn!(error = %err, "unrecoverable error while accepting connection");
                        return Err(TproxyError::Accept(err.to_string()));
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("transparent TCP listener shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Forward one intercepted connection.
///
/// `original_dst` is the destination the client actually dialed. Public so
/// the flow can be driven with a pre-known destination (tests, alternate
/// dispatch mechanisms).
pub async fn proxy_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    original_dst: SocketAddr,
    mapper: Arc<dyn Mapper>,
    dialer: Arc<dyn Dialer>,
    dial_timeout: Duration,
) {
    let IpAddr::V4(virtual_ip) = canonical_ip(original_dst.ip()) else {
        warn!(dst = %original_dst, "non-IPv4 original destination, dropping");
        return;
    };

    let key = client_key(peer);
    let domain = match mapper.reverse_lookup(&key, virtual_ip).await {
        Ok(Some(domain)) if !domain.is_empty() => domain,
        Ok(_) => {
            debug!(client = %key, addr = %virtual_ip, "reverse mapping not found, dropping");
            return;
        }
        Err(err) => {
            warn!(client = %key, addr = %virtual_ip, error = %err, "reverse lookup failed");
            return;
        }
    };

    let port = original_dst.port();
    info!(client = %peer, domain = %domain, addr = %virtual_ip, port, "TCP flow open");

    let mut upstream = match timeout(dial_timeout, dialer.dial_tcp(&domain, port)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(domain = %domain, port, error = %err, "upstream dial failed");
            return;
        }
        Err(_) => {
            warn!(domain = %domain, port, "upstream dial timed out");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            info!(client = %peer, domain = %domain, to_upstream, to_client, "TCP flow closed");
        }
        Err(err) => {
            debug!(client = %peer, domain = %domain, error = %err, "TCP flow ended with error");
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
