//! Upstream dialer abstraction
//!
//! The forwarder reaches upstreams through this capability trait so tests
//! can pin resolution to loopback stubs. The default implementation uses
//! the system resolver via tokio's address lookup.

use std::io;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};

/// Opens upstream connections to `(host, port)` targets, where `host` is a
/// domain name recovered from the mapping store.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a TCP connection to the target.
    async fn dial_tcp(&self, host: &str, port: u16) -> io::Result<TcpStream>;

    /// Open a connected UDP socket to the target.
    async fn dial_udp(&self, host: &str, port: u16) -> io::Result<UdpSocket>;
}

/// Default dialer using the system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetDialer;

#[async_trait]
impl Dialer for NetDialer {
    async fn dial_tcp(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        TcpStream::connect((host, port)).await
    }

    async fn dial_udp(&self, host: &str, port: u16) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect((host, port)).await?;
        Ok(socket)
    }
}
