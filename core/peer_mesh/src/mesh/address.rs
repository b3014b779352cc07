//! Address candidates for session peers
//!
//! A candidate is one (transport, endpoint) pair believed to possibly reach
//! a peer, plus the number of connection attempts made with it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

// ============================================================================
// Transport
// ============================================================================

/// Transport protocol of a candidate or connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "TCP"),
            Transport::Udp => write!(f, "UDP"),
        }
    }
}

// ============================================================================
// Peer Address
// ============================================================================

/// Transport plus endpoint
///
/// Serialized endpoints never carry an IPv6 scope id; scopes only have a
/// meaning on the host that observed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub transport: Transport,
    pub endpoint: SocketAddr,
}

impl PeerAddress {
    pub fn new(transport: Transport, endpoint: SocketAddr) -> Self {
        // IPv4-mapped IPv6 endpoints are stored as plain IPv4 so that both
        // spellings of one address compare equal.
        Self {
            transport,
            endpoint: unmap_ipv4(endpoint),
        }
    }

    pub fn tcp(endpoint: SocketAddr) -> Self {
        Self::new(Transport::Tcp, endpoint)
    }

    pub fn udp(endpoint: SocketAddr) -> Self {
        Self::new(Transport::Udp, endpoint)
    }

    /// Host part is the any-address (0.0.0.0 or ::)
    pub fn is_null_host(&self) -> bool {
        self.endpoint.ip().is_unspecified()
    }

    /// Replace the host part, keeping port and transport
    pub fn with_ip(&self, ip: IpAddr) -> Self {
        Self::new(self.transport, SocketAddr::new(ip, self.endpoint.port()))
    }

    /// Replace the port, keeping host and transport
    pub fn with_port(&self, port: u16) -> Self {
        let mut endpoint = self.endpoint;
        endpoint.set_port(port);
        Self::new(self.transport, endpoint)
    }

    /// Interface scope of an IPv6 endpoint (0 = unscoped)
    pub fn scope_id(&self) -> u32 {
        scope_id(&self.endpoint)
    }

    /// Same address with the scope id cleared
    pub fn without_scope(&self) -> Self {
        Self::new(self.transport, with_scope(self.endpoint, 0))
    }

    pub fn is_link_local(&self) -> bool {
        is_link_local(&self.endpoint.ip())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport, self.endpoint)
    }
}

// ============================================================================
// Address Candidate
// ============================================================================

/// A known address of a peer and how often it has been tried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressCandidate {
    pub address: PeerAddress,
    /// Connection attempts made with this candidate; never reset
    pub attempts: u32,
}

impl AddressCandidate {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            attempts: 0,
        }
    }
}

impl fmt::Display for AddressCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} attempts {}", self.address, self.attempts)
    }
}

// ============================================================================
// Address Classification
// ============================================================================

/// fe80::/10 for IPv6, 169.254/16 for IPv4
pub fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_link_local(),
        IpAddr::V6(addr) => (addr.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// fc00::/7 (unique local addresses)
fn is_unique_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

/// Whether an endpoint qualifies for TCP simultaneous open
///
/// Only globally routable IPv6 unicast addresses do: no loopback,
/// link-local, unique-local, multicast or unspecified hosts.
pub fn is_global_ipv6(endpoint: &SocketAddr) -> bool {
    match endpoint.ip() {
        IpAddr::V4(_) => false,
        IpAddr::V6(addr) => {
            addr.to_ipv4_mapped().is_none()
                && !addr.is_loopback()
                && !addr.is_unspecified()
                && !addr.is_multicast()
                && !is_link_local(&IpAddr::V6(addr))
                && !is_unique_local(&addr)
        }
    }
}

pub fn scope_id(endpoint: &SocketAddr) -> u32 {
    match endpoint {
        SocketAddr::V4(_) => 0,
        SocketAddr::V6(v6) => v6.scope_id(),
    }
}

/// Set the scope id of an IPv6 endpoint (IPv4 endpoints are returned as-is)
pub fn with_scope(endpoint: SocketAddr, scope: u32) -> SocketAddr {
    match endpoint {
        SocketAddr::V4(_) => endpoint,
        SocketAddr::V6(v6) => {
            SocketAddr::V6(SocketAddrV6::new(*v6.ip(), v6.port(), v6.flowinfo(), scope))
        }
    }
}

fn unmap_ipv4(endpoint: SocketAddr) -> SocketAddr {
    match endpoint {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => endpoint,
        },
        SocketAddr::V4(_) => endpoint,
    }
}

// ============================================================================
// Platform-specific Interface Enumeration
// ============================================================================

/// Enumerate local network interface addresses using libc
///
/// Returns IPv4 and IPv6 addresses of all non-loopback interfaces with the
/// given port. IPv6 link-local addresses keep their interface index as
/// scope id.
#[cfg(unix)]
pub fn enumerate_local_addresses(port: u16) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return addrs;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            if !ifa.ifa_addr.is_null() {
                let family = (*ifa.ifa_addr).sa_family as i32;
                if family == libc::AF_INET {
                    let sockaddr_in = ifa.ifa_addr as *const libc::sockaddr_in;
                    let ip_bytes = (*sockaddr_in).sin_addr.s_addr.to_ne_bytes();
                    let ip = Ipv4Addr::new(ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3]);

                    if !ip.is_loopback() {
                        addrs.push(SocketAddr::new(IpAddr::V4(ip), port));
                    }
                } else if family == libc::AF_INET6 {
                    let sockaddr_in6 = ifa.ifa_addr as *const libc::sockaddr_in6;
                    let ip = Ipv6Addr::from((*sockaddr_in6).sin6_addr.s6_addr);

                    if !ip.is_loopback() {
                        let scope = if is_link_local(&IpAddr::V6(ip)) {
                            (*sockaddr_in6).sin6_scope_id
                        } else {
                            0
                        };
                        addrs.push(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope)));
                    }
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    addrs
}

#[cfg(not(unix))]
pub fn enumerate_local_addresses(_port: u16) -> Vec<SocketAddr> {
    Vec::new()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_display() {
        assert_eq!(Transport::Tcp.to_string(), "TCP");
        assert_eq!(Transport::Udp.to_string(), "UDP");
    }

    #[test]
    fn test_null_host_rewrite() {
        let addr = PeerAddress::udp("0.0.0.0:11115".parse().unwrap());
        assert!(addr.is_null_host());

        let rewritten = addr.with_ip("203.0.113.7".parse().unwrap());
        assert!(!rewritten.is_null_host());
        assert_eq!(rewritten.endpoint, "203.0.113.7:11115".parse::<SocketAddr>().unwrap());
        assert_eq!(rewritten.transport, Transport::Udp);
    }

    #[test]
    fn test_mapped_ipv4_is_unmapped() {
        let mapped = PeerAddress::tcp("[::ffff:192.0.2.1]:11112".parse().unwrap());
        let plain = PeerAddress::tcp("192.0.2.1:11112".parse().unwrap());
        assert_eq!(mapped, plain);
    }

    #[test]
    fn test_with_port() {
        let addr = PeerAddress::udp("198.51.100.4:40000".parse().unwrap());
        assert_eq!(addr.with_port(11115).endpoint.port(), 11115);
    }

    #[test]
    fn test_global_ipv6_classification() {
        assert!(is_global_ipv6(&"[2001:db8::1]:0".parse().unwrap()));
        assert!(!is_global_ipv6(&"[::1]:0".parse().unwrap()));
        assert!(!is_global_ipv6(&"[fe80::1]:0".parse().unwrap()));
        assert!(!is_global_ipv6(&"[fd00::1]:0".parse().unwrap()));
        assert!(!is_global_ipv6(&"[::]:0".parse().unwrap()));
        assert!(!is_global_ipv6(&"192.0.2.1:0".parse().unwrap()));
        assert!(!is_global_ipv6(&"[::ffff:192.0.2.1]:0".parse().unwrap()));
    }

    #[test]
    fn test_scope_handling() {
        let scoped = PeerAddress::tcp(with_scope("[fe80::1]:11112".parse().unwrap(), 3));
        assert!(scoped.is_link_local());
        assert_eq!(scoped.scope_id(), 3);
        assert_eq!(scoped.without_scope().scope_id(), 0);
    }

    #[test]
    fn test_candidate_starts_untried() {
        let candidate = AddressCandidate::new(PeerAddress::tcp("192.0.2.1:11112".parse().unwrap()));
        assert_eq!(candidate.attempts, 0);
        assert!(candidate.to_string().contains("TCP:192.0.2.1:11112"));
    }

    #[test]
    fn test_enumerate_local_addresses() {
        // May be empty on some systems, which is fine
        let addrs = enumerate_local_addresses(11112);
        for addr in &addrs {
            assert!(!addr.ip().is_loopback());
            assert_eq!(addr.port(), 11112);
        }
    }
}
