//! Transparent forwarder
//!
//! Receives TCP connections and UDP datagrams addressed to the virtual
//! range via kernel TPROXY dispatch, reverses each flow's virtual
//! destination back to the domain that produced it, and forwards the flow
//! to a freshly resolved upstream.
//!
//! # Requirements
//!
//! - Linux kernel with TPROXY support
//! - `CAP_NET_ADMIN` (or root) to set `IP_TRANSPARENT`
//! - Routing and firewall rules delivering the virtual range locally;
//!   dns44 does not configure these itself
//!
//! ## Required sysctls
//!
//! ```bash
//! sysctl -w net.ipv4.conf.all.route_localnet=1
//! sysctl -w net.ipv4.ip_nonlocal_bind=1
//! sysctl -w net.ipv4.conf.all.rp_filter=0
//! ```
//!
//! `ip_nonlocal_bind` matters for the UDP reply path: each flow's reply
//! socket binds to the virtual destination so replies carry
//! `src = virtual_dst` on the wire.
//!
//! ## Example redirection setup
//!
//! ```bash
//! ip rule add fwmark 0x1 lookup 100
//! ip route add local 0.0.0.0/0 dev lo table 100
//!
//! iptables -t mangle -A PREROUTING -d 172.24.0.0/16 -p tcp -j TPROXY \
//!     --on-ip 127.0.0.1 --on-port 4480 --tproxy-mark 0x1
//! iptables -t mangle -A PREROUTING -d 172.24.0.0/16 -p udp -j TPROXY \
//!     --on-ip 127.0.0.1 --on-port 4480 --tproxy-mark 0x1
//! ```

mod dialer;
mod future_conn;
mod socket;
mod tcp;
mod udp;
mod udp_listener;

pub use dialer::{Dialer, NetDialer};
pub use future_conn::{FutureUdpConn, DEFAULT_BACKLOG};
pub use socket::{
    create_tproxy_tcp_socket, create_tproxy_udp_socket, has_net_admin_capability, is_root,
    recv_with_original_dst, SocketProvider, TransparentSocketProvider, IP_RECVORIGDSTADDR,
    IP_TRANSPARENT,
};
pub use tcp::{proxy_connection, TcpProxy};
pub use udp::UdpProxy;
pub use udp_listener::TproxyUdpListener;
