//! Network transport abstraction.
//!
//! The walker never opens sockets itself. A [`Transport`] dials peers, issues
//! the DHT closest-peers RPC, and keeps the local view of what is known about
//! each peer (addresses, and the agent and protocols learned while connected).

use crate::error::TransportError;
use crate::peer::AddrInfo;
use libp2p::{Multiaddr, PeerId};
use std::future::Future;

/// Connections and DHT requests used while walking.
///
/// Implementations are shared across all walk workers, so every method takes
/// `&self`.
pub trait Transport: Send + Sync + 'static {
    /// Dial a peer.
    ///
    /// # Arguments
    ///
    /// * `peer` - The peer and the addresses to try.
    fn connect(
        &self,
        peer: &AddrInfo,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Ask a connected peer for the peers it knows closest to `key`.
    ///
    /// # Arguments
    ///
    /// * `peer` - The connected peer to ask.
    /// * `key` - The identifier whose neighbourhood is requested.
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<AddrInfo>)` - The routing records the peer returned.
    /// * `Err(TransportError)` - If the request could not be completed.
    fn closest_peers(
        &self,
        peer: &PeerId,
        key: &PeerId,
    ) -> impl Future<Output = Result<Vec<AddrInfo>, TransportError>> + Send;

    /// Remember addresses for a peer so a later [`Transport::connect`] can use them.
    fn add_addresses(&self, peer: &PeerId, addrs: &[Multiaddr]);

    /// Addresses currently known for a peer.
    fn addresses(&self, peer: &PeerId) -> Vec<Multiaddr>;

    /// Agent version learned from the peer, if any.
    fn agent_version(&self, peer: &PeerId) -> Option<String>;

    /// Protocols learned from the peer, if any.
    fn protocols(&self, peer: &PeerId) -> Option<Vec<String>>;

    /// Close every connection to the peer.
    fn close_peer(&self, peer: &PeerId);
}
