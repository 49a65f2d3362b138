//! Network groups and address routability.
//!
//! Bucketing diversity rests on an oracle that maps addresses to opaque
//! group keys: addresses in the same group compete for the same small set
//! of buckets. The default oracle groups by `/16` range for IPv4 and by
//! the first 32 bits for IPv6, under the assumption that adversaries are
//! *localized*.

use std::net;

/// Maps an address to the key of the network group it belongs to.
///
/// Implementations must be deterministic: the same address always maps to
/// the same key. The key is treated as an opaque byte-vector; its domain
/// influences bucketing diversity but not correctness, so alternative
/// oracles (for example AS-number based ones) can be plugged in freely.
pub trait NetGroupManager: Send {
    /// Return the group key for the given address.
    fn group(&self, ip: &net::IpAddr) -> Vec<u8>;
}

/// The default group oracle, keyed on address prefix.
///
/// IPv4 addresses are grouped by their `/16` range, IPv6 addresses by their
/// first 32 bits. Eg. `124.99.123.1` and `124.54.123.1` belong to different
/// groups, while `100.99.43.12` and `100.99.12.8` share one.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixGroup;

impl NetGroupManager for PrefixGroup {
    fn group(&self, ip: &net::IpAddr) -> Vec<u8> {
        match ip {
            net::IpAddr::V4(ip) => {
                let octets = ip.octets();
                vec![1, octets[0], octets[1]]
            }
            net::IpAddr::V6(ip) => {
                let octets = ip.octets();
                vec![2, octets[0], octets[1], octets[2], octets[3]]
            }
        }
    }
}

/// Communication domain of a network socket.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Domain {
    /// IPv4.
    IPV4,
    /// IPv6.
    IPV6,
}

impl Domain {
    /// All domains.
    pub fn all() -> Vec<Self> {
        vec![Self::IPV4, Self::IPV6]
    }

    /// Returns the domain for `address`.
    pub const fn for_address(address: &net::SocketAddr) -> Domain {
        match address {
            net::SocketAddr::V4(_) => Domain::IPV4,
            net::SocketAddr::V6(_) => Domain::IPV6,
        }
    }
}

/// Check whether an IP address is globally routable.
pub fn is_routable(addr: &net::IpAddr) -> bool {
    match addr {
        net::IpAddr::V4(addr) => ipv4_is_routable(addr),
        net::IpAddr::V6(addr) => ipv6_is_routable(addr),
    }
}

/// Check whether an IPv4 address is globally routable.
///
/// This code is adapted from the Rust standard library's
/// `net::Ipv4Addr::is_global`. It can be replaced once that function is
/// stabilized.
fn ipv4_is_routable(addr: &net::Ipv4Addr) -> bool {
    // Check if this address is 192.0.0.9 or 192.0.0.10. These addresses are
    // the only two globally routable addresses in the 192.0.0.0/24 range.
    if u32::from(*addr) == 0xc0000009 || u32::from(*addr) == 0xc000000a {
        return true;
    }
    !addr.is_private()
        && !addr.is_loopback()
        && !addr.is_link_local()
        && !addr.is_broadcast()
        && !addr.is_documentation()
        // Make sure the address is not in 0.0.0.0/8.
        && addr.octets()[0] != 0
}

/// Check whether an IPv6 address is globally routable.
fn ipv6_is_routable(addr: &net::Ipv6Addr) -> bool {
    !addr.is_loopback() && !addr.is_unspecified()
}
