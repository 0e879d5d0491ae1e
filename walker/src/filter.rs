//! Filters for addresses learned from other peers' routing tables.

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Decides which discovered addresses are handed to the transport.
///
/// Peers are queued for walking regardless of the filter; only the addresses
/// remembered for them are affected.
#[derive(Clone, Default)]
pub enum AddressFilter {
    /// Keep every address.
    AllowAll,
    /// Keep IP addresses that are neither private nor loopback.
    #[default]
    Public,
    /// Keep everything [`AddressFilter::Public`] rejects.
    Private,
    /// Keep IPv4 addresses.
    Ipv4,
    /// Keep IPv6 addresses.
    Ipv6,
    /// Keep TCP addresses.
    Tcp,
    /// Keep UDP addresses.
    Udp,
    /// Keep addresses the function accepts.
    Custom(Arc<dyn Fn(&Multiaddr) -> bool + Send + Sync>),
}

impl AddressFilter {
    /// Whether the filter keeps `addr`.
    pub fn allows(&self, addr: &Multiaddr) -> bool {
        match self {
            AddressFilter::AllowAll => true,
            AddressFilter::Public => is_public(addr),
            AddressFilter::Private => !is_public(addr),
            AddressFilter::Ipv4 => addr.iter().any(|p| matches!(p, Protocol::Ip4(_))),
            AddressFilter::Ipv6 => addr.iter().any(|p| matches!(p, Protocol::Ip6(_))),
            AddressFilter::Tcp => addr.iter().any(|p| matches!(p, Protocol::Tcp(_))),
            AddressFilter::Udp => addr.iter().any(|p| matches!(p, Protocol::Udp(_))),
            AddressFilter::Custom(f) => f(addr),
        }
    }

    /// The addresses in `addrs` the filter keeps.
    pub fn apply(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        addrs.iter().filter(|a| self.allows(a)).cloned().collect()
    }
}

impl fmt::Debug for AddressFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFilter::AllowAll => write!(f, "AllowAll"),
            AddressFilter::Public => write!(f, "Public"),
            AddressFilter::Private => write!(f, "Private"),
            AddressFilter::Ipv4 => write!(f, "Ipv4"),
            AddressFilter::Ipv6 => write!(f, "Ipv6"),
            AddressFilter::Tcp => write!(f, "Tcp"),
            AddressFilter::Udp => write!(f, "Udp"),
            AddressFilter::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// The first IP component decides, addresses without one are not public.
fn is_public(addr: &Multiaddr) -> bool {
    for protocol in addr.iter() {
        match protocol {
            Protocol::Ip4(ip) => return is_public_v4(&ip),
            Protocol::Ip6(ip) => return is_public_v6(&ip),
            _ => {}
        }
    }
    false
}

fn is_public_v4(ip: &Ipv4Addr) -> bool {
    !(ip.is_private() || ip.is_loopback() || ip.is_unspecified())
}

fn is_public_v6(ip: &Ipv6Addr) -> bool {
    // fc00::/7 unique local.
    let unique_local = (ip.segments()[0] & 0xfe00) == 0xfc00;
    !(unique_local || ip.is_loopback() || ip.is_unspecified())
}
