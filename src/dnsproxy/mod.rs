//! DNS front-end
//!
//! Serves DNS over UDP and TCP on the configured bind address. A queries
//! are answered from the mapping store so every `(client, domain)` pair
//! resolves to a virtual address from the configured range; AAAA queries
//! return an empty NoError answer; all other query types are relayed to the
//! upstream resolver unchanged.

mod rewrite;
mod tcp_server;
mod udp_server;
mod upstream;

pub use rewrite::{is_rewritable, rewrite_query};
pub use tcp_server::DnsTcpServer;
pub use udp_server::DnsUdpServer;
pub use upstream::UpstreamResolver;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::DnsProxyConfig;
use crate::error::DnsProxyError;
use crate::mapping::Mapper;

/// DNS proxy: the UDP and TCP server halves bound to one address.
pub struct DnsProxy {
    udp: DnsUdpServer,
    tcp: DnsTcpServer,
}

impl std::fmt::Debug for DnsProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsProxy").finish()
    }
}

impl DnsProxy {
    /// Bind both halves per the configuration.
    pub async fn bind(
        config: &DnsProxyConfig,
        mapper: Arc<dyn Mapper>,
    ) -> Result<Self, DnsProxyError> {
        let upstream = Arc::new(UpstreamResolver::new(config.upstream_addr()?));

        let udp = DnsUdpServer::bind(
            config.listen_addr,
            Arc::clone(&mapper),
            Arc::clone(&upstream),
            config.ttl,
        )
        .await?;
        let tcp = DnsTcpServer::bind(config.listen_addr, mapper, upstream, config.ttl).await?;

        Ok(Self { udp, tcp })
    }

    /// Local address of the UDP half.
    pub fn udp_local_addr(&self) -> Result<SocketAddr, DnsProxyError> {
        self.udp.local_addr()
    }

    /// Local address of the TCP half.
    pub fn tcp_local_addr(&self) -> Result<SocketAddr, DnsProxyError> {
        self.tcp.local_addr()
    }

    /// Run both halves until shutdown; returns when the first half exits.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), DnsProxyError> {
        info!("starting DNS server");

        let handles: Vec<JoinHandle<Result<(), DnsProxyError>>> = vec![
            tokio::spawn(self.udp.run(shutdown.clone())),
            tokio::spawn(self.tcp.run(shutdown)),
        ];

        let (result, _, rest) = futures::future::select_all(handles).await;
        for handle in rest {
            handle.abort();
        }
        result.map_err(|e| DnsProxyError::Io(std::io::Error::other(e)))?
    }
}
