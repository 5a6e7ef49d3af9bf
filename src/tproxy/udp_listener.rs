//! Transparent UDP listener
//!
//! One socket receives every intercepted datagram; the original destination
//! of each rides along in ancillary data. Unlike the TCP half there is no
//! per-flow socket on the inbound side — flow separation happens in the
//! conntrack table.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UdpSocket;
use tracing::{info, trace};

use super::socket::{recv_with_original_dst, SocketProvider};
use crate::error::UdpError;

/// Transparent UDP listener with original-destination recovery.
pub struct TproxyUdpListener {
    socket: UdpSocket,
    listen_addr: SocketAddr,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl TproxyUdpListener {
    /// Create the listener socket through `provider` and bind it.
    pub fn bind(addr: SocketAddr, provider: &dyn SocketProvider) -> Result<Self, UdpError> {
        let socket = provider.create_udp_listener_socket()?;
        socket
            .bind(&addr.into())
            .map_err(|e| UdpError::socket_option("bind", format!("bind to {addr}: {e}")))?;

        let std_socket = unsafe { std::net::UdpSocket::from_raw_fd(socket.into_raw_fd()) };
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| UdpError::socket_option("from_std", e.to_string()))?;

        info!(addr = %addr, "transparent UDP listener ready");

        Ok(Self {
            socket,
            listen_addr: addr,
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    /// Receive one datagram; returns `(len, source, original_destination)`.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr, SocketAddr), UdpError> {
        loop {
            self.socket.readable().await.map_err(UdpError::Io)?;

            let fd = self.socket.as_raw_fd();
            match recv_with_original_dst(fd, buf) {
                Ok((n, src, dst)) => {
                    self.packets_received.fetch_add(1, Ordering::Relaxed);
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    trace!(src = %src, dst = %dst, len = n, "intercepted datagram");
                    return Ok((n, src, dst));
                }
                // Readiness was stale; wait again.
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                // Non-TPROXY packet (no cmsg) or truncated control data.
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    return Err(UdpError::Recv(e.to_string()))
                }
                Err(e) => return Err(UdpError::Io(e)),
            }
        }
    }

    /// The configured listen address.
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Datagrams received so far.
    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// Bytes received so far.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}
