//! DNS-over-TCP server
//!
//! Same query handling as the UDP half, framed with the RFC 1035 two-byte
//! length prefix. Each accepted connection is served in its own task and may
//! carry any number of queries.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, trace};

use super::udp_server::answer_query;
use super::upstream::UpstreamResolver;
use crate::error::DnsProxyError;
use crate::mapping::Mapper;

/// DNS-over-TCP server half.
pub struct DnsTcpServer {
    listener: TcpListener,
    mapper: Arc<dyn Mapper>,
    upstream: Arc<UpstreamResolver>,
    ttl: u32,
}

impl DnsTcpServer {
    /// Bind the TCP half to `addr`.
    pub async fn bind(
        addr: SocketAddr,
        mapper: Arc<dyn Mapper>,
        upstream: Arc<UpstreamResolver>,
        ttl: u32,
    ) -> Result<Self, DnsProxyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DnsProxyError::Bind {
                addr,
                reason: e.to_string(),
            })?;

        Ok(Self {
            listener,
            mapper,
            upstream,
            ttl,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, DnsProxyError> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Run the accept loop until the shutdown signal fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DnsProxyError> {
        if let Ok(addr) = self.local_addr() {
            info!(addr = %addr, "DNS TCP server listening");
        }

        loop {
            tokio::select! {
                res = self.listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(conn) => conn,
                        Err(err) => {
                            error!(error = %err, "DNS TCP accept error");
                            time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };
                    trace!(peer = %peer, "DNS TCP client accepted");

                    let mapper = Arc::clone(&self.mapper);
                    let upstream = Arc::clone(&self.upstream);
                    let ttl = self.ttl;
                    tokio::spawn(async move {
                        if let Err(err) =
                            serve_client(stream, peer, mapper, upstream, ttl).await
                        {
                            debug!(peer = %peer, error = %err, "DNS TCP client error");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("DNS TCP server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn serve_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    mapper: Arc<dyn Mapper>,
    upstream: Arc<UpstreamResolver>,
    ttl: u32,
) -> std::io::Result<()> {
    let mut length_buf = [0u8; 2];
    let mut message_buf = BytesMut::new();

    loop {
        match stream.read_exact(&mut length_buf).await {
            Ok(..) => {}
            Err(ref err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err),
        }

        let length = usize::from(u16::from_be_bytes(length_buf));
        if length == 0 {
            debug!(peer = %peer, "zero-length DNS message skipped");
            continue;
        }

        message_buf.resize(length, 0);
        stream.read_exact(&mut message_buf).await?;

        let Some(rsp) = answer_query(&message_buf, peer, mapper.as_ref(), &upstream, ttl).await
        else {
            continue;
        };

        #[allow(clippy::cast_possible_truncation)] // DNS messages cap at 64 KiB
        let prefix = (rsp.len() as u16).to_be_bytes();
        stream.write_all(&prefix).await?;
        stream.write_all(&rsp).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::testing::MemoryMapper;
    use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::{Name, RData, RecordType};
    use std::str::FromStr;

    fn test_upstream() -> Arc<UpstreamResolver> {
        Arc::new(
            UpstreamResolver::new("127.0.0.1:1".parse().unwrap())
                .with_timeout(Duration::from_millis(50)),
        )
    }

    fn query_bytes(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
        let mut req = Message::new();
        req.set_id(id);
        req.set_message_type(MessageType::Query);
        req.set_op_code(OpCode::Query);
        req.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        req.to_vec().unwrap()
    }

    async fn exchange(stream: &mut TcpStream, query: &[u8]) -> Message {
        #[allow(clippy::cast_possible_truncation)]
        let prefix = (query.len() as u16).to_be_bytes();
        stream.write_all(&prefix).await.unwrap();
        stream.write_all(query).await.unwrap();

        let mut length_buf = [0u8; 2];
        stream.read_exact(&mut length_buf).await.unwrap();
        let mut rsp = vec![0u8; usize::from(u16::from_be_bytes(length_buf))];
        stream.read_exact(&mut rsp).await.unwrap();
        Message::from_vec(&rsp).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_a_query() {
        let mapper: Arc<dyn Mapper> = Arc::new(MemoryMapper::new());
        let server = DnsTcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            mapper,
            test_upstream(),
            60,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(server.run(rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let rsp = exchange(&mut client, &query_bytes(7, "example.com.", RecordType::A)).await;

        assert_eq!(rsp.id(), 7);
        assert_eq!(rsp.answers().len(), 1);
        assert!(matches!(rsp.answers()[0].data(), Some(RData::A(_))));
    }

    #[tokio::test]
    async fn test_tcp_multiple_queries_one_connection() {
        let mapper: Arc<dyn Mapper> = Arc::new(MemoryMapper::new());
        let server = DnsTcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            mapper,
            test_upstream(),
            60,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(server.run(rx));

        let mut client = TcpStream::connect(addr).await.unwrap();

        let first = exchange(&mut client, &query_bytes(1, "one.example.", RecordType::A)).await;
        let second = exchange(&mut client, &query_bytes(2, "two.example.", RecordType::A)).await;

        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert_eq!(first.response_code(), ResponseCode::NoError);
        assert_eq!(second.response_code(), ResponseCode::NoError);
    }

    #[tokio::test]
    async fn test_tcp_client_eof_closes_cleanly() {
        let mapper: Arc<dyn Mapper> = Arc::new(MemoryMapper::new());
        let server = DnsTcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            mapper,
            test_upstream(),
            60,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(rx));

        let client = TcpStream::connect(addr).await.unwrap();
        drop(client);

        // Server keeps running after a client hangs up.
        time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
    }
}
