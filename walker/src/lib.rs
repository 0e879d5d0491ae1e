//! Walks a Kademlia DHT by dumping the routing table of every reachable peer.
//!
//! Each peer's buckets are enumerated with closest-peers requests against
//! precomputed identifiers from a [`PreimageTable`], one identifier per
//! common prefix length.

mod builder;
mod error;
mod filter;
mod key;
mod memory;
mod observer;
mod peer;
mod preimage;
mod session;
mod shutdown;
mod transport;
mod walker;

pub use builder::{
    default_seeds, WalkerBuilder, WalkerBuilderError, DEFAULT_BOOTSTRAP_ADDRS,
    DEFAULT_CONCURRENCY, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DISPATCH_INTERVAL,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use error::{AddrInfoError, PeerFailure, TransportError, WalkError};
pub use filter::AddressFilter;
pub use key::{KadKey, KEY_BITS, KEY_BYTES};
pub use memory::{MemoryTransport, SimulatedNode};
pub use observer::{CollectorObserver, MultiObserver, NullObserver, Observer, PeerObserverFn};
pub use peer::{AddrInfo, CrawlError, Peer, RequestSample, WalkResult};
pub use preimage::{PreimageError, PreimageTable, DEFAULT_PREFIX_BITS, MAX_PREFIX_BITS};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use transport::Transport;
pub use walker::{dump, DumpError, Walker};

// Re-exports.
pub use libp2p::{Multiaddr, PeerId};
