//! Transparent UDP forwarding
//!
//! Flows are tracked by `(source, original destination)`. The first
//! datagram of a flow resolves the virtual destination back to its domain,
//! creates a deferred-dial upstream handle and a reply socket bound to the
//! virtual destination, and starts a reply pump. The receive loop never
//! waits on an upstream dial — that is the future connection's job.
//!
//! The conntrack mutex is held only across map operations, never across
//! I/O. A flow dies when its upstream read fails with anything other than
//! `ECONNREFUSED`, or after the idle deadline passes with no upstream
//! traffic.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::dialer::Dialer;
use super::future_conn::FutureUdpConn;
use super::socket::{SocketProvider, TransparentSocketProvider};
use super::udp_listener::TproxyUdpListener;
use crate::config::ProxyConfig;
use crate::error::UdpError;
use crate::mapping::Mapper;
use crate::net::{canonical_addr, client_key};

/// Receive buffer size, the UDP maximum
const UDP_BUF_SIZE: usize = 65535;

/// One tracked flow: inbound 2-tuple to upstream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    client: SocketAddr,
    original_dst: SocketAddr,
}

type ConnTrack = Arc<Mutex<HashMap<FlowKey, Arc<FutureUdpConn>>>>;

/// Transparent UDP proxy half.
pub struct UdpProxy {
    mapper: Arc<dyn Mapper>,
    dialer: Arc<dyn Dialer>,
    provider: Arc<dyn SocketProvider>,
    dial_timeout: Duration,
    idle_timeout: Duration,
    backlog: usize,
    conntrack: ConnTrack,
}

impl UdpProxy {
    /// Create the proxy with the production socket provider.
    #[must_use]
    pub fn new(config: &ProxyConfig, mapper: Arc<dyn Mapper>, dialer: Arc<dyn Dialer>) -> Self {
        Self::with_provider(config, mapper, dialer, Arc::new(TransparentSocketProvider))
    }

    /// Create the proxy with a custom socket provider.
    #[must_use]
    pub fn with_provider(
        config: &ProxyConfig,
        mapper: Arc<dyn Mapper>,
        dialer: Arc<dyn Dialer>,
        provider: Arc<dyn SocketProvider>,
    ) -> Self {
        Self {
            mapper,
            dialer,
            provider,
            dial_timeout: config.dial_timeout,
            idle_timeout: config.udp_idle_timeout,
            backlog: config.udp_backlog,
            conntrack: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bind the transparent listener for this proxy's configuration.
    pub fn bind_listener(&self, config: &ProxyConfig) -> Result<TproxyUdpListener, UdpError> {
        TproxyUdpListener::bind(config.listen_addr, self.provider.as_ref())
    }

    /// Number of live conntrack entries.
    #[must_use]
    pub fn active_flows(&self) -> usize {
        self.conntrack.lock().len()
    }

    /// Receive loop; runs until the shutdown signal fires.
    pub async fn run(
        self: Arc<Self>,
        listener: TproxyUdpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), UdpError> {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        loop {
            tokio::select! {
                res = listener.recv(&mut buf) => match res {
                    Ok((n, client, original_dst)) => {
                        let payload = Bytes::copy_from_slice(&buf[..n]);
                        self.dispatch(payload, client, original_dst, &shutdown).await;
                    }
                    // Malformed dispatch (no cmsg, truncation): skip packet.
                    Err(UdpError::Recv(reason)) => {
                        warn!(reason = %reason, "datagram without original destination dropped");
                    }
                    Err(err) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        warn!(error = %err, "stopping UDP proxy");
                        self.close_all();
                        return Err(err);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("transparent UDP listener shutting down");
        self.close_all();
        Ok(())
    }

    /// Route one datagram to its flow, creating the flow on first sight.
    async fn dispatch(
        &self,
        payload: Bytes,
        client: SocketAddr,
        original_dst: SocketAddr,
        shutdown: &watch::Receiver<bool>,
    ) {
        let key = FlowKey {
            client: canonical_addr(client),
            original_dst: canonical_addr(original_dst),
        };

        let existing = self.conntrack.lock().get(&key).cloned();
        let conn = match existing {
            Some(conn) => conn,
            None => match self.open_flow(key, shutdown.clone()).await {
                Some(conn) => conn,
                None => return,
            },
        };

        match conn.send(&payload).await {
            Ok(_) => {}
            Err(UdpError::BacklogOverflow) => {
                warn!(client = %key.client, "flow backlog full, datagram dropped");
            }
            Err(err) => {
                debug!(client = %key.client, error = %err, "upstream write failed");
            }
        }
    }

    /// Resolve the flow's domain, set up the deferred upstream and the
    /// reply pump. Returns `None` (datagram dropped, no entry) on any
    /// failure, mapping misses included.
    async fn open_flow(
        &self,
        key: FlowKey,
        shutdown: watch::Receiver<bool>,
    ) -> Option<Arc<FutureUdpConn>> {
        let IpAddr::V4(virtual_ip) = key.original_dst.ip() else {
            warn!(dst = %key.original_dst, "non-IPv4 original destination, dropping");
            return None;
        };

        let ckey = client_key(key.client);
        let domain = match self.mapper.reverse_lookup(&ckey, virtual_ip).await {
            Ok(Some(domain)) if !domain.is_empty() => domain,
            Ok(_) => {
                debug!(client = %ckey, addr = %virtual_ip, "reverse mapping not found, dropping");
                return None;
            }
            Err(err) => {
                warn!(client = %ckey, addr = %virtual_ip, error = %err, "reverse lookup failed");
                return None;
            }
        };

        let reply_socket = match self.make_reply_socket(key.original_dst) {
            Ok(socket) => socket,
            Err(err) => {
                warn!(dst = %key.original_dst, error = %err, "reply socket setup failed");
                return None;
            }
        };

        let port = key.original_dst.port();
        info!(client = %key.client, domain = %domain, addr = %virtual_ip, port, "UDP flow open");

        let dialer = Arc::clone(&self.dialer);
        let dial_timeout = self.dial_timeout;
        let dial_domain = domain.clone();
        let conn = FutureUdpConn::connect(
            async move {
                match timeout(dial_timeout, dialer.dial_udp(&dial_domain, port)).await {
                    Ok(res) => res,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "upstream dial timed out",
                    )),
                }
            },
            self.backlog,
        );

        self.conntrack.lock().insert(key, Arc::clone(&conn));

        tokio::spawn(reply_pump(
            Arc::clone(&conn),
            Arc::new(reply_socket),
            key,
            Arc::clone(&self.conntrack),
            self.idle_timeout,
            shutdown,
        ));

        Some(conn)
    }

    fn make_reply_socket(&self, original_dst: SocketAddr) -> Result<UdpSocket, UdpError> {
        let socket = self.provider.create_reply_socket(original_dst)?;
        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket)
            .map_err(|e| UdpError::reply_socket(original_dst, e.to_string()))
    }

    /// Drop every tracked flow; their sockets close as the pumps unwind.
    fn close_all(&self) {
        let drained = {
            let mut table = self.conntrack.lock();
            let n = table.len();
            table.clear();
            n
        };
        if drained > 0 {
            debug!(flows = drained, "conntrack drained");
        }
    }
}

/// Per-flow reply pump: upstream reads go back to the client from the
/// virtual destination. `ECONNREFUSED` is tolerated — the last write may
/// have raced a not-yet-listening port — anything else reaps the flow, as
/// does the idle deadline.
async fn reply_pump(
    conn: Arc<FutureUdpConn>,
    reply_socket: Arc<UdpSocket>,
    key: FlowKey,
    conntrack: ConnTrack,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        let read = tokio::select! {
            read = timeout(idle_timeout, conn.recv(&mut buf)) => read,
            _ = shutdown.changed() => break,
        };

        match read {
            Err(_) => {
                debug!(client = %key.client, "UDP flow idle, reaping");
                break;
            }
            Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionRefused => {
                // Nothing listening upstream right now; keep waiting.
                continue;
            }
            Ok(Err(err)) => {
                debug!(client = %key.client, error = %err, "upstream read failed, reaping");
                break;
            }
            Ok(Ok(n)) => {
                if let Err(err) = reply_socket.send_to(&buf[..n], key.client).await {
                    debug!(client = %key.client, error = %err, "reply send failed, reaping");
                    break;
                }
            }
        }
    }

    conntrack.lock().remove(&key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::testing::MemoryMapper;
    use crate::tproxy::dialer::testing::{FailingDialer, StubDialer};
    use crate::tproxy::socket::PlainSocketProvider;
    use std::net::Ipv4Addr;
    use tokio::time::sleep;

    fn test_config(idle: Duration) -> ProxyConfig {
        ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            dial_timeout: Duration::from_secs(2),
            udp_idle_timeout: idle,
            udp_backlog: 16,
        }
    }

    fn proxy_with(
        mapper: Arc<MemoryMapper>,
        dialer: Arc<dyn Dialer>,
        idle: Duration,
    ) -> Arc<UdpProxy> {
        Arc::new(UdpProxy::with_provider(
            &test_config(idle),
            mapper,
            dialer,
            Arc::new(PlainSocketProvider),
        ))
    }

    fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_flow_delivers_datagrams_in_order() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let mapper = Arc::new(MemoryMapper::new());
        mapper.seed("127.0.0.1", "stream.local", Ipv4Addr::new(10, 0, 0, 2));
        // Stalled dial: all three datagrams arrive before it resolves.
        let dialer = Arc::new(StubDialer::with_delay(
            upstream_addr,
            Duration::from_millis(300),
        ));

        let proxy = proxy_with(mapper, dialer, Duration::from_secs(30));
        let client: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        let virtual_dst: SocketAddr = "10.0.0.2:53".parse().unwrap();
        let (_shutdown_tx, shutdown) = shutdown_channel();

        for i in 0..3u8 {
            proxy
                .dispatch(Bytes::copy_from_slice(&[i]), client, virtual_dst, &shutdown)
                .await;
        }
        assert_eq!(proxy.active_flows(), 1);

        let mut buf = [0u8; 1];
        for expected in 0..3u8 {
            let (n, _) = timeout(Duration::from_secs(2), upstream.recv_from(&mut buf))
                .await
                .expect("datagram should arrive after the deferred dial")
                .unwrap();
            assert_eq!(n, 1);
            assert_eq!(buf[0], expected);
        }
    }

    #[tokio::test]
    async fn test_replies_reach_the_client() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let mapper = Arc::new(MemoryMapper::new());
        mapper.seed("127.0.0.1", "echo.local", Ipv4Addr::new(10, 0, 0, 5));
        let dialer = Arc::new(StubDialer::new(upstream_addr));

        let proxy = proxy_with(mapper, dialer, Duration::from_secs(30));

        // Real client socket so the reply pump has somewhere to send.
        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = client_socket.local_addr().unwrap();
        let virtual_dst: SocketAddr = "10.0.0.5:53".parse().unwrap();
        let (_shutdown_tx, shutdown) = shutdown_channel();

        proxy
            .dispatch(Bytes::from_static(b"query"), client, virtual_dst, &shutdown)
            .await;

        // Upstream answers; the pump forwards to the client.
        let mut buf = [0u8; 64];
        let (n, peer) = timeout(Duration::from_secs(2), upstream.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"query");
        upstream.send_to(b"answer", peer).await.unwrap();

        let (n, _) = timeout(Duration::from_secs(2), client_socket.recv_from(&mut buf))
            .await
            .expect("reply should be pumped back")
            .unwrap();
        assert_eq!(&buf[..n], b"answer");
    }

    #[tokio::test]
    async fn test_mapping_miss_creates_no_flow() {
        let mapper = Arc::new(MemoryMapper::new());
        let dialer = Arc::new(FailingDialer);
        let proxy = proxy_with(mapper, dialer, Duration::from_secs(30));
        let (_shutdown_tx, shutdown) = shutdown_channel();

        proxy
            .dispatch(
                Bytes::from_static(b"x"),
                "127.0.0.1:40000".parse().unwrap(),
                "10.0.0.9:53".parse().unwrap(),
                &shutdown,
            )
            .await;

        assert_eq!(proxy.active_flows(), 0);
    }

    #[tokio::test]
    async fn test_idle_flow_is_reaped() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let mapper = Arc::new(MemoryMapper::new());
        mapper.seed("127.0.0.1", "quiet.local", Ipv4Addr::new(10, 0, 0, 6));
        let dialer = Arc::new(StubDialer::new(upstream_addr));

        let proxy = proxy_with(mapper, dialer, Duration::from_millis(100));
        let (_shutdown_tx, shutdown) = shutdown_channel();

        proxy
            .dispatch(
                Bytes::from_static(b"hello"),
                "127.0.0.1:40001".parse().unwrap(),
                "10.0.0.6:53".parse().unwrap(),
                &shutdown,
            )
            .await;
        assert_eq!(proxy.active_flows(), 1);

        // No upstream traffic; the pump must reap the entry.
        sleep(Duration::from_millis(400)).await;
        assert_eq!(proxy.active_flows(), 0);
    }

    #[tokio::test]
    async fn test_failed_dial_flow_is_reaped() {
        let mapper = Arc::new(MemoryMapper::new());
        mapper.seed("127.0.0.1", "dead.local", Ipv4Addr::new(10, 0, 0, 7));
        let dialer = Arc::new(FailingDialer);

        let proxy = proxy_with(mapper, dialer, Duration::from_secs(30));
        let (_shutdown_tx, shutdown) = shutdown_channel();

        proxy
            .dispatch(
                Bytes::from_static(b"x"),
                "127.0.0.1:40002".parse().unwrap(),
                "10.0.0.7:53".parse().unwrap(),
                &shutdown,
            )
            .await;

        // The pump observes the dial failure and removes the entry.
        sleep(Duration::from_millis(200)).await;
        assert_eq!(proxy.active_flows(), 0);
    }

    #[tokio::test]
    async fn test_two_clients_same_virtual_dst_are_distinct_flows() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let mapper = Arc::new(MemoryMapper::new());
        mapper.seed("127.0.0.1", "shared.local", Ipv4Addr::new(10, 0, 0, 8));
        let dialer = Arc::new(StubDialer::new(upstream_addr));

        let proxy = proxy_with(mapper, dialer, Duration::from_secs(30));
        let virtual_dst: SocketAddr = "10.0.0.8:53".parse().unwrap();
        let (_shutdown_tx, shutdown) = shutdown_channel();

        proxy
            .dispatch(
                Bytes::from_static(b"a"),
                "127.0.0.1:40100".parse().unwrap(),
                virtual_dst,
                &shutdown,
            )
            .await;
        proxy
            .dispatch(
                Bytes::from_static(b"b"),
                "127.0.0.1:40101".parse().unwrap(),
                virtual_dst,
                &shutdown,
            )
            .await;

        assert_eq!(proxy.active_flows(), 2);
    }
}
