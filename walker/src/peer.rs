//! Records produced by walking DHT peers.

use crate::error::{AddrInfoError, PeerFailure};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::fmt;
use std::time::{Duration, SystemTime};

/// A peer identifier together with the addresses it can be dialed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddrInfo {
    /// The peer's identifier.
    pub id: PeerId,
    /// Addresses advertised for the peer, without the `/p2p` suffix.
    pub addrs: Vec<Multiaddr>,
}

impl AddrInfo {
    /// Create a new routing record.
    pub fn new(id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        AddrInfo { id, addrs }
    }

    /// Split a `/.../p2p/<peer id>` multiaddr into a routing record.
    ///
    /// # Arguments
    ///
    /// * `addr` - A multiaddr whose last component names the peer.
    ///
    /// # Returns
    ///
    /// * `Ok(AddrInfo)` - The peer with the transport part as its only address.
    /// * `Err(AddrInfoError)` - If the multiaddr does not end in a `/p2p` component.
    pub fn from_p2p_multiaddr(addr: &Multiaddr) -> Result<Self, AddrInfoError> {
        let mut transport = addr.clone();
        match transport.pop() {
            Some(Protocol::P2p(id)) => {
                let addrs = if transport.is_empty() {
                    Vec::new()
                } else {
                    vec![transport]
                };
                Ok(AddrInfo { id, addrs })
            }
            _ => Err(AddrInfoError::MissingPeerId(addr.to_string())),
        }
    }

    /// Parse a textual `/.../p2p/<peer id>` multiaddr.
    pub fn parse(addr: &str) -> Result<Self, AddrInfoError> {
        let multiaddr = addr
            .parse::<Multiaddr>()
            .map_err(|_| AddrInfoError::InvalidMultiaddr(addr.to_string()))?;
        Self::from_p2p_multiaddr(&multiaddr)
    }
}

impl fmt::Display for AddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.id)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{addr}")?;
        }
        write!(f, ")")
    }
}

/// Timing of a single closest-peers request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSample {
    /// Wall clock time the request was issued.
    pub start: SystemTime,
    /// How long the request took to answer.
    pub duration: Duration,
}

/// A peer that was connected to and had its routing table dumped.
#[derive(Debug, Clone)]
pub struct Peer {
    /// The peer's identifier.
    pub id: PeerId,
    /// Addresses known for the peer when it was walked.
    pub addresses: Vec<Multiaddr>,
    /// Agent version reported by the peer, empty if unknown.
    pub agent: String,
    /// Protocols the peer supports, empty if unknown.
    pub protocols: Vec<String>,
    /// One entry per probed bucket, ordered by common prefix length.
    pub buckets: Vec<Vec<AddrInfo>>,
    /// One sample per closest-peers request.
    pub requests: Vec<RequestSample>,
    /// Wall clock time the dial started.
    pub connect_start: SystemTime,
    /// How long the dial took.
    pub connect_duration: Duration,
}

impl Peer {
    /// Checks if the peer advertises the specified protocol.
    pub fn supports_protocol(&self, protocol: &str) -> bool {
        self.protocols.iter().any(|p| p == protocol)
    }

    /// Every routing record found in the peer's buckets, in bucket order.
    pub fn routing_table(&self) -> impl Iterator<Item = &AddrInfo> {
        self.buckets.iter().flatten()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ([peer] agent: {}, protocols: {}, buckets: {}, entries: {})",
            self.id,
            if self.agent.is_empty() {
                "unknown"
            } else {
                &self.agent
            },
            self.protocols.len(),
            self.buckets.len(),
            self.routing_table().count()
        )
    }
}

/// A peer that could not be walked.
#[derive(Debug)]
pub struct CrawlError {
    /// The peer's identifier.
    pub id: PeerId,
    /// Addresses known for the peer when it was walked.
    pub addresses: Vec<Multiaddr>,
    /// Wall clock time the walk of this peer started.
    pub time: SystemTime,
    /// What went wrong.
    pub cause: PeerFailure,
}

impl fmt::Display for CrawlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.cause)
    }
}

impl std::error::Error for CrawlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Outcome of walking one peer.
pub type WalkResult = Result<Peer, CrawlError>;
