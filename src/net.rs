//! Address normalization helpers
//!
//! The transparent listeners may surface peers as IPv4-mapped IPv6 addresses
//! when bound on a dual-stack socket. The mapping store keys on canonical
//! IPv4 literals, so every address crossing a component boundary is unmapped
//! first.

use std::net::{IpAddr, SocketAddr};

/// Unmap an IPv4-mapped IPv6 address to its canonical IPv4 form.
///
/// Plain IPv4 and genuine IPv6 addresses are returned unchanged.
#[must_use]
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => ip,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
    }
}

/// Canonicalize the IP part of a socket address, keeping the port.
#[must_use]
pub fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(canonical_ip(addr.ip()), addr.port())
}

/// Derive the mapping-store client key from a peer address.
///
/// The key is the canonical IP literal of the peer; ports are deliberately
/// excluded so every flow from one host shares its bindings.
#[must_use]
pub fn client_key(addr: SocketAddr) -> String {
    canonical_ip(addr.ip()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_canonical_ip_v4_passthrough() {
        let ip = IpAddr::V4(Ipv4Addr::new(172, 24, 0, 1));
        assert_eq!(canonical_ip(ip), ip);
    }

    #[test]
    fn test_canonical_ip_unmaps_v4_mapped() {
        let mapped: Ipv6Addr = "::ffff:172.24.0.1".parse().unwrap();
        assert_eq!(
            canonical_ip(IpAddr::V6(mapped)),
            IpAddr::V4(Ipv4Addr::new(172, 24, 0, 1))
        );
    }

    #[test]
    fn test_canonical_ip_keeps_real_v6() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(canonical_ip(ip), ip);
    }

    #[test]
    fn test_client_key_drops_port() {
        let addr: SocketAddr = "127.0.0.1:54321".parse().unwrap();
        assert_eq!(client_key(addr), "127.0.0.1");
    }

    #[test]
    fn test_client_key_unmaps() {
        let addr: SocketAddr = "[::ffff:10.1.2.3]:1000".parse().unwrap();
        assert_eq!(client_key(addr), "10.1.2.3");
    }

    #[test]
    fn test_canonical_addr_keeps_port() {
        let addr: SocketAddr = "[::ffff:10.1.2.3]:443".parse().unwrap();
        let canon = canonical_addr(addr);
        assert_eq!(canon, "10.1.2.3:443".parse().unwrap());
    }
}
