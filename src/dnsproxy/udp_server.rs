//! DNS-over-UDP server
//!
//! Receives queries on the DNS bind address, rewrites A/AAAA locally and
//! relays everything else upstream. Each packet is handled in its own task
//! so a slow upstream exchange never stalls the receive loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, ResponseCode};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use super::rewrite::{is_rewritable, rewrite_query};
use super::upstream::UpstreamResolver;
use crate::error::DnsProxyError;
use crate::mapping::Mapper;

/// Maximum inbound DNS message size over UDP (EDNS0 ceiling)
const MAX_UDP_MESSAGE_SIZE: usize = 65535;

/// DNS-over-UDP server half.
pub struct DnsUdpServer {
    socket: Arc<UdpSocket>,
    mapper: Arc<dyn Mapper>,
    upstream: Arc<UpstreamResolver>,
    ttl: u32,
}

impl DnsUdpServer {
    /// Bind the UDP half to `addr`.
    pub async fn bind(
        addr: SocketAddr,
        mapper: Arc<dyn Mapper>,
        upstream: Arc<UpstreamResolver>,
        ttl: u32,
    ) -> Result<Self, DnsProxyError> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| DnsProxyError::Bind {
            addr,
            reason: e.to_string(),
        })?;

        Ok(Self {
            socket: Arc::new(socket),
            mapper,
            upstream,
            ttl,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, DnsProxyError> {
        self.socket.local_addr().map_err(Into::into)
    }

    /// Run the receive loop until the shutdown signal fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DnsProxyError> {
        if let Ok(addr) = self.local_addr() {
            info!(addr = %addr, "DNS UDP server listening");
        }

        let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];
        loop {
            tokio::select! {
                res = self.socket.recv_from(&mut buf) => {
                    let (n, peer) = match res {
                        Ok(r) => r,
                        Err(err) => {
                            error!(error = %err, "DNS UDP recv error");
                            time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };
                    trace!(peer = %peer, len = n, "DNS UDP query received");

                    let query = buf[..n].to_vec();
                    let socket = Arc::clone(&self.socket);
                    let mapper = Arc::clone(&self.mapper);
                    let upstream = Arc::clone(&self.upstream);
                    let ttl = self.ttl;
                    tokio::spawn(async move {
                        if let Some(rsp) =
                            answer_query(&query, peer, mapper.as_ref(), &upstream, ttl).await
                        {
                            if let Err(err) = socket.send_to(&rsp, peer).await {
                                debug!(peer = %peer, error = %err, "DNS UDP send failed");
                            }
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("DNS UDP server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Produce the response bytes for one query, or `None` when nothing
/// sendable could be built.
pub(super) async fn answer_query(
    query: &[u8],
    peer: SocketAddr,
    mapper: &dyn Mapper,
    upstream: &UpstreamResolver,
    ttl: u32,
) -> Option<Vec<u8>> {
    let req = match Message::from_vec(query) {
        Ok(m) => m,
        Err(err) => {
            debug!(peer = %peer, error = %err, "DNS parse error");
            return None;
        }
    };

    if is_rewritable(&req) {
        let rsp = match rewrite_query(&req, peer, mapper, ttl).await {
            Ok(rsp) => rsp,
            Err(err) => {
                warn!(peer = %peer, error = %err, "rewrite failed");
                Message::error_msg(req.id(), req.op_code(), ResponseCode::ServFail)
            }
        };
        return match rsp.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                error!(error = %err, "DNS response encode error");
                None
            }
        };
    }

    match upstream.forward(query).await {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(peer = %peer, error = %err, "upstream forward failed");
            Message::error_msg(req.id(), req.op_code(), ResponseCode::ServFail)
                .to_vec()
                .ok()
        }
    }
}
