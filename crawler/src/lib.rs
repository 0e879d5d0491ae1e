//! Continuous DHT crawler that tracks telemetry-capable peers.
//!
//! A [`Crawler`] repeatedly walks the DHT with a [`Walker`], keeping the
//! membership of the current pass and streaming newly found telemetry peers
//! to its [`Subscription`]s.

mod builder;
mod crawler;
mod metrics;
mod observer;
mod subscription;

pub use builder::{
    CrawlerBuilder, CrawlerBuilderError, DEFAULT_PASS_DELAY, DEFAULT_SUBSCRIBER_CAPACITY,
    DEFAULT_TELEMETRY_PROTOCOL,
};
pub use crawler::{Crawler, PassSummary};
pub use metrics::{MetricsSnapshot, PassCounts};
pub use observer::CrawlObserver;
pub use subscription::Subscription;

// Re-exports.
pub use dht_peers_walker::{
    shutdown_channel, AddrInfo, AddressFilter, CrawlError, MemoryTransport, Multiaddr, Observer,
    Peer, PeerId, ShutdownSignal, ShutdownTrigger, SimulatedNode, Transport, WalkError, Walker,
    WalkerBuilder, WalkerBuilderError,
};
