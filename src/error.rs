//! Error types for dns44
//!
//! Errors are categorized by subsystem, mirroring the component split of the
//! forwarder: configuration, address pool, mapping store, DNS proxy and the
//! transparent forwarder (TCP and UDP halves).

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for dns44
#[derive(Debug, Error)]
pub enum Dns44Error {
    /// Configuration errors (flag parsing, validation)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Address pool construction errors
    #[error("address pool error: {0}")]
    Pool(#[from] PoolError),

    /// Mapping store errors
    #[error("mapping store error: {0}")]
    Mapping(#[from] MappingError),

    /// DNS proxy errors
    #[error("DNS proxy error: {0}")]
    Dns(#[from] DnsProxyError),

    /// Transparent socket and TCP forwarding errors
    #[error("TPROXY error: {0}")]
    Tproxy(#[from] TproxyError),

    /// UDP forwarding errors
    #[error("UDP forwarding error: {0}")]
    Udp(#[from] UdpError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
///
/// These are fatal at startup; nothing retries a bad flag.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Address-port could not be parsed
    #[error("invalid address-port {value:?}: {reason}")]
    InvalidAddrPort { value: String, reason: String },

    /// IP range could not be parsed
    #[error("invalid IP range {value:?}: {reason}")]
    InvalidRange { value: String, reason: String },

    /// Duration could not be parsed
    #[error("invalid duration {value:?}")]
    InvalidDuration { value: String },
}

impl ConfigError {
    /// Create an invalid address-port error
    pub fn addr_port(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddrPort {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid range error
    pub fn range(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Address pool construction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// A range endpoint is not an IPv4 address
    #[error("unsupported address family")]
    UnsupportedAddressFamily,

    /// End of range is less than start of range
    #[error("end of range is less than start of range")]
    BadOrder,
}

/// Mapping store errors
#[derive(Debug, Error)]
pub enum MappingError {
    /// The allocator exhausted its retry budget without finding a free address
    #[error("too many failed attempts")]
    TooManyAttempts,

    /// Database error surfaced from the SQL engine
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// A persisted address failed to parse back into an IPv4 address
    #[error("can't parse IP address {value:?} from database")]
    BadStoredAddr { value: String },

    /// The blocking task running the query was cancelled or panicked
    #[error("mapping task failed: {0}")]
    Task(String),
}

/// DNS proxy errors
#[derive(Debug, Error)]
pub enum DnsProxyError {
    /// Invalid proxy configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Failed to bind a DNS listener
    #[error("failed to bind DNS listener on {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Mapping store failure while synthesizing a response
    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// The upstream resolver did not answer in time
    #[error("upstream resolver {addr} timed out")]
    UpstreamTimeout { addr: SocketAddr },

    /// DNS message encoding failure
    #[error("DNS message encode error: {0}")]
    Encode(String),

    /// I/O error on a DNS socket
    #[error("DNS I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Transparent socket and TCP forwarding errors
#[derive(Debug, Error)]
pub enum TproxyError {
    /// Failed to create a socket
    #[error("failed to create transparent socket: {0}")]
    SocketCreation(String),

    /// Failed to set a socket option (IP_TRANSPARENT, etc.)
    #[error("failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind to an address
    #[error("failed to bind to {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Unrecoverable accept failure
    #[error("accept error: {0}")]
    Accept(String),

    /// Permission denied (CAP_NET_ADMIN required)
    #[error("permission denied: transparent sockets require CAP_NET_ADMIN")]
    PermissionDenied,

    /// I/O error
    #[error("TPROXY I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TproxyError {
    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Bind {
            addr,
            reason: reason.into(),
        }
    }
}

/// UDP forwarding errors
#[derive(Debug, Error)]
pub enum UdpError {
    /// Permission denied (CAP_NET_ADMIN required)
    #[error("permission denied: transparent UDP sockets require CAP_NET_ADMIN")]
    PermissionDenied,

    /// Failed to set a socket option
    #[error("failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// recvmsg failure or missing original-destination control message
    #[error("UDP receive error: {0}")]
    Recv(String),

    /// Failed to create or bind the per-flow reply socket
    #[error("failed to create reply socket for {addr}: {reason}")]
    ReplySocket { addr: SocketAddr, reason: String },

    /// The future connection's backlog is full; the datagram was dropped
    #[error("backlog overflow")]
    BacklogOverflow,

    /// The deferred upstream dial failed; the flow is unusable
    #[error("upstream dial failed: {0}")]
    DialFailed(String),

    /// I/O error
    #[error("UDP I/O error: {0}")]
    Io(#[from] io::Error),
}

impl UdpError {
    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a reply socket error
    pub fn reply_socket(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ReplySocket {
            addr,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_messages() {
        assert_eq!(
            PoolError::UnsupportedAddressFamily.to_string(),
            "unsupported address family"
        );
        assert_eq!(
            PoolError::BadOrder.to_string(),
            "end of range is less than start of range"
        );
    }

    #[test]
    fn test_backlog_overflow_message() {
        assert_eq!(UdpError::BacklogOverflow.to_string(), "backlog overflow");
    }

    #[test]
    fn test_error_conversion() {
        let err: Dns44Error = PoolError::BadOrder.into();
        assert!(matches!(err, Dns44Error::Pool(PoolError::BadOrder)));

        let err: Dns44Error = MappingError::TooManyAttempts.into();
        assert!(matches!(
            err,
            Dns44Error::Mapping(MappingError::TooManyAttempts)
        ));
    }

    #[test]
    fn test_helper_constructors() {
        let err = TproxyError::socket_option("IP_TRANSPARENT", "EPERM");
        assert!(err.to_string().contains("IP_TRANSPARENT"));

        let addr: SocketAddr = "10.0.0.1:53".parse().unwrap();
        let err = UdpError::reply_socket(addr, "bind failed");
        assert!(err.to_string().contains("10.0.0.1:53"));
    }
}
