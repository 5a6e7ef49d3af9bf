//! DNS query rewriting
//!
//! A queries are answered from the mapping store: each `(client, domain)`
//! pair is bound to a virtual address and the synthesized A record points at
//! it. AAAA queries get an empty NoError answer so clients cannot sidestep
//! the mapping by resolving over IPv6. Everything else is the upstream
//! resolver's business and never reaches this module.

use std::net::SocketAddr;
use std::time::Duration;

use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use tracing::{debug, warn};

use crate::error::DnsProxyError;
use crate::mapping::Mapper;
use crate::net::client_key;

/// Whether the first question is one the rewriter answers locally.
///
/// Queries that fail this test are forwarded to the upstream resolver
/// verbatim.
#[must_use]
pub fn is_rewritable(req: &Message) -> bool {
    matches!(
        req.queries().first().map(hickory_proto::op::Query::query_type),
        Some(RecordType::A | RecordType::AAAA)
    )
}

/// Synthesize a response for an A or AAAA query.
///
/// The stored binding outlives the advertised TTL by one second so a client
/// connecting right at the TTL boundary still reverse-resolves.
pub async fn rewrite_query(
    req: &Message,
    src: SocketAddr,
    mapper: &dyn Mapper,
    ttl: u32,
) -> Result<Message, DnsProxyError> {
    let mut rsp = Message::new();
    rsp.set_header(Header::response_from_request(req.header()));

    if req.op_code() != OpCode::Query || req.message_type() != MessageType::Query {
        rsp.set_response_code(ResponseCode::NotImp);
        return Ok(rsp);
    }

    let Some(query) = req.queries().first() else {
        return Ok(rsp);
    };
    rsp.add_query(query.clone());

    if query.query_class() != DNSClass::IN {
        warn!(class = ?query.query_class(), "unsupported DNS class, returning empty answer");
        return Ok(rsp);
    }

    let qname = query.name().to_string();
    let domain = qname.trim_end_matches('.').to_ascii_lowercase();

    match query.query_type() {
        RecordType::A => {
            let key = client_key(src);
            let addr = mapper
                .ensure_mapping(&key, &domain, Duration::from_secs(u64::from(ttl) + 1))
                .await?;

            let mut record = Record::from_rdata(query.name().clone(), ttl, RData::A(A(addr)));
            record.set_dns_class(query.query_class());
            rsp.add_answer(record);

            debug!(client = %key, domain = %domain, addr = %addr, "rewrote A query");
        }
        RecordType::AAAA => {
            // NoData: the forwarder only vends IPv4.
            debug!(domain = %domain, "AAAA query answered empty");
        }
        other => {
            debug!(qtype = %other, domain = %domain, "query type not rewritable");
        }
    }

    Ok(rsp)
}
