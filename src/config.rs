//! Configuration types for dns44
//!
//! Runtime configuration is assembled from command-line flags; the types
//! here carry it down to the components. Defaults match the documented
//! flag defaults.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default DNS listener address (TCP+UDP)
pub const DEFAULT_DNS_BIND: &str = "127.0.0.1:4453";

/// Default transparent proxy listener address (TCP+UDP)
pub const DEFAULT_PROXY_BIND: &str = "127.0.0.1:4480";

/// Default upstream resolver for queries the rewriter does not handle
pub const DEFAULT_UPSTREAM: &str = "1.1.1.1";

/// Default virtual IPv4 range, inclusive
pub const DEFAULT_IP_RANGE: &str = "172.24.0.0-172.24.255.255";

/// Default TTL (seconds) for synthesized A responses
pub const DEFAULT_TTL: u32 = 900;

/// Default upstream dial timeout (TCP and UDP)
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle deadline after which a UDP flow is reaped
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Default per-flow backlog of datagrams buffered while the dial resolves
pub const DEFAULT_UDP_BACKLOG: usize = 256;

/// An inclusive IPv4 address range in `start-end` form.
///
/// Parsing only splits and parses the two addresses; family and ordering
/// are validated by the address pool, which is the component that owns
/// those invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    /// First address of the range
    pub start: IpAddr,
    /// Last address of the range, inclusive
    pub end: IpAddr,
}

impl FromStr for AddressRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((start, end)) = s.split_once('-') else {
            return Err(ConfigError::range(
                s,
                "expected two addresses separated by '-'",
            ));
        };
        let start: IpAddr = start
            .trim()
            .parse()
            .map_err(|e| ConfigError::range(s, format!("unable to parse start address: {e}")))?;
        let end: IpAddr = end
            .trim()
            .parse()
            .map_err(|e| ConfigError::range(s, format!("unable to parse end address: {e}")))?;
        Ok(Self { start, end })
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl Default for AddressRange {
    fn default() -> Self {
        DEFAULT_IP_RANGE.parse().expect("default range is valid")
    }
}

/// DNS proxy configuration
#[derive(Debug, Clone)]
pub struct DnsProxyConfig {
    /// Address the DNS server listens on (TCP and UDP)
    pub listen_addr: SocketAddr,
    /// Upstream resolver, `ip` or `ip:port` (port defaults to 53)
    pub upstream: String,
    /// TTL in seconds placed on synthesized A records
    pub ttl: u32,
}

impl DnsProxyConfig {
    /// Resolve the upstream flag value into a socket address.
    ///
    /// A bare IP gets the standard DNS port appended.
    pub fn upstream_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Ok(addr) = self.upstream.parse::<SocketAddr>() {
            return Ok(addr);
        }
        if let Ok(ip) = self.upstream.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, 53));
        }
        Err(ConfigError::addr_port(
            &self.upstream,
            "expected an IP address or IP:port",
        ))
    }
}

impl Default for DnsProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_DNS_BIND.parse().expect("default bind is valid"),
            upstream: DEFAULT_UPSTREAM.to_string(),
            ttl: DEFAULT_TTL,
        }
    }
}

/// Transparent forwarder configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the transparent listeners bind to (TCP and UDP)
    pub listen_addr: SocketAddr,
    /// Upstream dial timeout
    pub dial_timeout: Duration,
    /// Idle deadline for UDP conntrack entries
    pub udp_idle_timeout: Duration,
    /// Datagrams buffered per flow while the upstream dial resolves
    pub udp_backlog: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_PROXY_BIND.parse().expect("default bind is valid"),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
            udp_backlog: DEFAULT_UDP_BACKLOG,
        }
    }
}

/// Parse a human-friendly duration: `10s`, `500ms`, `2m` or bare seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration {
        value: s.to_string(),
    };

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    match unit {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(invalid()),
    }
}
