//! Transparent socket plumbing
//!
//! Low-level pieces of the TPROXY dispatch path:
//!
//! - `IP_TRANSPARENT` lets the listeners receive traffic addressed to the
//!   virtual range (and the reply sockets bind to virtual addresses).
//! - `IP_RECVORIGDSTADDR` makes the kernel attach the original destination
//!   of each UDP datagram as ancillary data, recovered here via `recvmsg`.
//!
//! Setting `IP_TRANSPARENT` requires `CAP_NET_ADMIN`. Socket creation is
//! abstracted behind [`SocketProvider`] so tests can run unprivileged.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::{TproxyError, UdpError};

/// Linux `IP_TRANSPARENT` socket option (`SOL_IP` level)
pub const IP_TRANSPARENT: libc::c_int = 19;

/// Linux `IP_RECVORIGDSTADDR` socket option (`SOL_IP` level)
pub const IP_RECVORIGDSTADDR: libc::c_int = 20;

/// Control-message buffer size; ample for one `sockaddr_in`
const CMSG_BUFFER_SIZE: usize = 64;

/// Abstracts privileged socket creation.
///
/// The production implementation sets `IP_TRANSPARENT`; tests substitute
/// plain sockets so the forwarder logic runs without `CAP_NET_ADMIN`.
pub trait SocketProvider: Send + Sync {
    /// Create the transparent UDP listener socket (`IP_TRANSPARENT` +
    /// `IP_RECVORIGDSTADDR`), unbound.
    fn create_udp_listener_socket(&self) -> Result<Socket, UdpError>;

    /// Create a reply socket bound to `bind_addr` — normally a virtual
    /// address, so the reply leaves the host with `src = virtual_dst`.
    fn create_reply_socket(&self, bind_addr: SocketAddr) -> Result<Socket, UdpError>;
}

/// Production provider using real transparent sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransparentSocketProvider;

impl SocketProvider for TransparentSocketProvider {
    fn create_udp_listener_socket(&self) -> Result<Socket, UdpError> {
        create_tproxy_udp_socket().map_err(|e| match e {
            TproxyError::PermissionDenied => UdpError::PermissionDenied,
            TproxyError::SocketOption { option, reason } => {
                UdpError::SocketOption { option, reason }
            }
            other => UdpError::socket_option("create", other.to_string()),
        })
    }

    fn create_reply_socket(&self, bind_addr: SocketAddr) -> Result<Socket, UdpError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| UdpError::reply_socket(bind_addr, e.to_string()))?;

        set_ip_transparent(&socket)
            .map_err(|e| UdpError::reply_socket(bind_addr, e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| UdpError::reply_socket(bind_addr, e.to_string()))?;

        // Non-local bind; needs ip_nonlocal_bind=1 in addition to the
        // transparent flag.
        socket.bind(&bind_addr.into()).map_err(|e| {
            UdpError::reply_socket(bind_addr, format!("bind failed (ip_nonlocal_bind?): {e}"))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| UdpError::reply_socket(bind_addr, e.to_string()))?;

        debug!(addr = %bind_addr, "created reply socket");
        Ok(socket)
    }
}

/// Create a TCP socket with `IP_TRANSPARENT` enabled, ready to bind.
pub fn create_tproxy_tcp_socket() -> Result<Socket, TproxyError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;

    set_ip_transparent(&socket)?;
    socket
        .set_reuse_address(true)
        .map_err(|e| TproxyError::socket_option("SO_REUSEADDR", e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TproxyError::socket_option("O_NONBLOCK", e.to_string()))?;

    debug!("created transparent TCP socket");
    Ok(socket)
}

/// Create a UDP socket with `IP_TRANSPARENT` and `IP_RECVORIGDSTADDR`
/// enabled, ready to bind.
pub fn create_tproxy_udp_socket() -> Result<Socket, TproxyError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;

    set_ip_transparent(&socket)?;
    set_ip_recvorigdstaddr(&socket)?;
    socket
        .set_reuse_address(true)
        .map_err(|e| TproxyError::socket_option("SO_REUSEADDR", e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TproxyError::socket_option("O_NONBLOCK", e.to_string()))?;

    debug!("created transparent UDP socket");
    Ok(socket)
}

fn set_ip_transparent(socket: &Socket) -> Result<(), TproxyError> {
    if let Err(err) = setsockopt_int(socket.as_raw_fd(), IP_TRANSPARENT) {
        if err.raw_os_error() == Some(libc::EPERM) {
            return Err(TproxyError::PermissionDenied);
        }
        return Err(TproxyError::socket_option("IP_TRANSPARENT", err.to_string()));
    }
    Ok(())
}

fn set_ip_recvorigdstaddr(socket: &Socket) -> Result<(), TproxyError> {
    setsockopt_int(socket.as_raw_fd(), IP_RECVORIGDSTADDR)
        .map_err(|e| TproxyError::socket_option("IP_RECVORIGDSTADDR", e.to_string()))
}

fn setsockopt_int(fd: RawFd, option: libc::c_int) -> io::Result<()> {
    let one: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_IP,
            option,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive one datagram plus its original destination from the cmsg.
///
/// Returns `(len, source, original_destination)`. Fails with `InvalidData`
/// when the control message is truncated or carries no original
/// destination — both mean the packet did not arrive via TPROXY dispatch.
#[allow(clippy::cast_possible_truncation)] // socklen_t is u32 everywhere we run
#[allow(clippy::cast_sign_loss)] // n checked non-negative
#[allow(clippy::cast_ptr_alignment)] // CMSG_DATA alignment guaranteed by the kernel
pub fn recv_with_original_dst(
    fd: RawFd,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, SocketAddr)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };
    let mut src_addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut cmsg_buf = [0u8; CMSG_BUFFER_SIZE];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(src_addr).cast::<libc::c_void>();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = std::ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = CMSG_BUFFER_SIZE;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    if (msg.msg_flags & libc::MSG_CTRUNC) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "control message truncated",
        ));
    }

    let src = sockaddr_in_to_addr(&src_addr);

    let mut original_dst = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::SOL_IP && header.cmsg_type == IP_RECVORIGDSTADDR {
            let addr = unsafe { &*libc::CMSG_DATA(cmsg).cast::<libc::sockaddr_in>() };
            original_dst = Some(sockaddr_in_to_addr(addr));
            break;
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    let dst = original_dst.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "original destination missing from cmsg",
        )
    })?;

    Ok((n as usize, src, dst))
}

fn sockaddr_in_to_addr(addr: &libc::sockaddr_in) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    ))
}

/// Whether the process can set `IP_TRANSPARENT`.
#[must_use]
pub fn has_net_admin_capability() -> bool {
    !matches!(
        create_tproxy_tcp_socket(),
        Err(TproxyError::PermissionDenied)
    )
}

/// Whether the effective UID is 0.
#[must_use]
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Unprivileged provider for tests: plain UDP sockets, reply sockets bound
/// to an ephemeral loopback port instead of the virtual destination.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainSocketProvider;

#[cfg(test)]
impl SocketProvider for PlainSocketProvider {
    fn create_udp_listener_socket(&self) -> Result<Socket, UdpError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| UdpError::socket_option("create", e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| UdpError::socket_option("O_NONBLOCK", e.to_string()))?;
        Ok(socket)
    }

    fn create_reply_socket(&self, bind_addr: SocketAddr) -> Result<Socket, UdpError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| UdpError::reply_socket(bind_addr, e.to_string()))?;
        let local: SocketAddr = "127.0.0.1:0".parse().expect("valid literal");
        socket
            .bind(&local.into())
            .map_err(|e| UdpError::reply_socket(bind_addr, e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| UdpError::reply_socket(bind_addr, e.to_string()))?;
        Ok(socket)
    }
}
