//! Upstream resolver relay
//!
//! Query types the rewriter does not handle are forwarded to the configured
//! upstream resolver byte-for-byte and the raw answer is relayed back, so no
//! information is lost in a parse/re-encode round trip. Each exchange uses a
//! fresh ephemeral UDP socket.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::trace;

use crate::error::DnsProxyError;

/// How long to wait for the upstream resolver before giving up
const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive buffer; large enough for EDNS0 responses
const UPSTREAM_RECV_BUFFER: usize = 4096;

/// Relay client for the upstream DNS resolver.
#[derive(Debug, Clone)]
pub struct UpstreamResolver {
    addr: SocketAddr,
    exchange_timeout: Duration,
}

impl UpstreamResolver {
    /// Create a resolver relay targeting `addr`.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }

    /// Override the exchange timeout.
    #[must_use]
    pub fn with_timeout(mut self, exchange_timeout: Duration) -> Self {
        self.exchange_timeout = exchange_timeout;
        self
    }

    /// The upstream address queries are relayed to.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Forward a raw DNS query and return the raw response.
    pub async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, DnsProxyError> {
        let bind_addr: SocketAddr = match self.addr.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.addr).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; UPSTREAM_RECV_BUFFER];
        let n = timeout(self.exchange_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| DnsProxyError::UpstreamTimeout { addr: self.addr })??;

        trace!(upstream = %self.addr, len = n, "relayed upstream response");
        buf.truncate(n);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forward_round_trip() {
        // A dummy "resolver" that echoes whatever it receives.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], peer).await.unwrap();
        });

        let resolver = UpstreamResolver::new(server_addr);
        let answer = resolver.forward(b"\x12\x34query").await.unwrap();
        assert_eq!(answer, b"\x12\x34query");
    }

    #[tokio::test]
    async fn test_forward_times_out_on_silence() {
        // Bound but never answering.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let resolver =
            UpstreamResolver::new(server_addr).with_timeout(Duration::from_millis(50));
        let err = resolver.forward(b"query").await.unwrap_err();
        assert!(matches!(err, DnsProxyError::UpstreamTimeout { .. }));
        drop(server);
    }
}
