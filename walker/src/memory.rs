//! In-memory simulated DHT network.
//!
//! [`MemoryTransport`] answers closest-peers requests from fixed per-bucket
//! routing tables, which makes whole walks reproducible without a network.

use crate::error::TransportError;
use crate::key::KadKey;
use crate::peer::AddrInfo;
use crate::transport::Transport;
use libp2p::{Multiaddr, PeerId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A node living in a [`MemoryTransport`] network.
#[derive(Debug, Clone, Default)]
pub struct SimulatedNode {
    /// Routing table buckets, indexed by common prefix length with the node.
    pub buckets: Vec<Vec<AddrInfo>>,
    /// Agent version reported after connecting.
    pub agent: Option<String>,
    /// Protocols reported after connecting.
    pub protocols: Vec<String>,
    /// Refuse every dial.
    pub unreachable: bool,
    /// Delay applied to dials and requests.
    pub latency: Duration,
    /// Extra delay applied to requests only.
    pub request_latency: Duration,
    /// Refuse every request after answering this many.
    pub failing_after: Option<usize>,
}

impl SimulatedNode {
    /// Create a reachable node with an empty routing table.
    pub fn new() -> Self {
        SimulatedNode::default()
    }

    /// Returns the node with `entries` in the given bucket.
    pub fn with_bucket(mut self, cpl: usize, entries: Vec<AddrInfo>) -> Self {
        if self.buckets.len() <= cpl {
            self.buckets.resize_with(cpl + 1, Vec::new);
        }
        self.buckets[cpl] = entries;
        self
    }

    /// Returns the node with an agent version.
    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }

    /// Returns the node advertising an additional protocol.
    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocols.push(protocol.to_string());
        self
    }

    /// Returns the node refusing dials.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Returns the node answering after a delay.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Returns the node answering requests after an extra delay.
    ///
    /// Dials are not slowed down.
    pub fn with_request_latency(mut self, latency: Duration) -> Self {
        self.request_latency = latency;
        self
    }

    /// Returns the node failing every request once it answered `answered` of them.
    pub fn with_request_failure(mut self, answered: usize) -> Self {
        self.failing_after = Some(answered);
        self
    }
}

#[derive(Debug, Default)]
struct Network {
    nodes: HashMap<PeerId, SimulatedNode>,
    addresses: HashMap<PeerId, Vec<Multiaddr>>,
    connected: HashSet<PeerId>,
    identified: HashSet<PeerId>,
    connect_attempts: HashMap<PeerId, usize>,
    requests: usize,
    answered: HashMap<PeerId, usize>,
}

/// A [`Transport`] backed by an in-memory network of [`SimulatedNode`]s.
///
/// Peers that were never added are unreachable.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    network: Arc<Mutex<Network>>,
}

impl MemoryTransport {
    /// Create an empty network.
    pub fn new() -> Self {
        MemoryTransport::default()
    }

    /// Add or replace a node.
    pub fn add_node(&self, id: PeerId, node: SimulatedNode) {
        self.lock().nodes.insert(id, node);
    }

    /// Number of dials attempted to a peer.
    pub fn connect_attempts(&self, id: &PeerId) -> usize {
        self.lock().connect_attempts.get(id).copied().unwrap_or(0)
    }

    /// Total dials attempted to any peer.
    pub fn total_connect_attempts(&self) -> usize {
        self.lock().connect_attempts.values().sum()
    }

    /// Every peer a dial was attempted to.
    pub fn dialed(&self) -> HashSet<PeerId> {
        self.lock().connect_attempts.keys().copied().collect()
    }

    /// Total closest-peers requests answered or refused.
    pub fn requests(&self) -> usize {
        self.lock().requests
    }

    /// Peers with an open connection.
    pub fn connected(&self) -> HashSet<PeerId> {
        self.lock().connected.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Network> {
        self.network.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_latency(&self, id: &PeerId) -> Duration {
        self.lock()
            .nodes
            .get(id)
            .map(|node| node.latency.saturating_add(node.request_latency))
            .unwrap_or_default()
    }
}

impl Transport for MemoryTransport {
    async fn connect(&self, peer: &AddrInfo) -> Result<(), TransportError> {
        let latency = {
            let mut network = self.lock();
            *network.connect_attempts.entry(peer.id).or_insert(0) += 1;
            network
                .nodes
                .get(&peer.id)
                .map(|node| node.latency)
                .unwrap_or_default()
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut network = self.lock();
        let reachable = network
            .nodes
            .get(&peer.id)
            .is_some_and(|node| !node.unreachable);
        if !reachable {
            return Err(TransportError::Unreachable);
        }
        network.connected.insert(peer.id);
        network.identified.insert(peer.id);
        Ok(())
    }

    async fn closest_peers(
        &self,
        peer: &PeerId,
        key: &PeerId,
    ) -> Result<Vec<AddrInfo>, TransportError> {
        let latency = self.request_latency(peer);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut network = self.lock();
        network.requests += 1;
        if !network.connected.contains(peer) {
            return Err(TransportError::NotConnected);
        }
        let answered = network.answered.get(peer).copied().unwrap_or(0);
        let Some(node) = network.nodes.get(peer) else {
            return Ok(Vec::new());
        };
        if node.failing_after.is_some_and(|limit| answered >= limit) {
            return Err(TransportError::Protocol("request refused".to_string()));
        }
        let cpl = KadKey::for_peer(peer).common_prefix_len(&KadKey::for_peer(key)) as usize;
        let entries = node.buckets.get(cpl).cloned().unwrap_or_default();
        *network.answered.entry(*peer).or_insert(0) += 1;
        Ok(entries)
    }

    fn add_addresses(&self, peer: &PeerId, addrs: &[Multiaddr]) {
        let mut network = self.lock();
        let known = network.addresses.entry(*peer).or_default();
        for addr in addrs {
            if !known.contains(addr) {
                known.push(addr.clone());
            }
        }
    }

    fn addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.lock().addresses.get(peer).cloned().unwrap_or_default()
    }

    fn agent_version(&self, peer: &PeerId) -> Option<String> {
        let network = self.lock();
        if !network.identified.contains(peer) {
            return None;
        }
        network.nodes.get(peer).and_then(|node| node.agent.clone())
    }

    fn protocols(&self, peer: &PeerId) -> Option<Vec<String>> {
        let network = self.lock();
        if !network.identified.contains(peer) {
            return None;
        }
        network.nodes.get(peer).map(|node| node.protocols.clone())
    }

    fn close_peer(&self, peer: &PeerId) {
        self.lock().connected.remove(peer);
    }
}
