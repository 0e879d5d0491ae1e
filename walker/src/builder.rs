//! Builder pattern for configuring and creating walker instances.

use crate::error::AddrInfoError;
use crate::filter::AddressFilter;
use crate::observer::{MultiObserver, NullObserver, Observer};
use crate::peer::AddrInfo;
use crate::preimage::{PreimageError, PreimageTable, DEFAULT_PREFIX_BITS};
use crate::session::{SessionConfig, WalkSession};
use crate::transport::Transport;
use crate::walker::Walker;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default timeout for dialing a peer.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default timeout for all closest-peers requests made to one peer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(25);
/// Default minimum gap between two dispatches.
pub const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_millis(20);
/// Default number of peers walked concurrently.
pub const DEFAULT_CONCURRENCY: usize = 128;

/// Public libp2p bootstrap nodes used when no seeds are configured.
pub const DEFAULT_BOOTSTRAP_ADDRS: [&str; 5] = [
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

/// Errors that can occur during walker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkerBuilderError {
    /// A seed address is not a `/p2p` multiaddr.
    InvalidSeedAddress(AddrInfoError),
    /// The preimage table could not be built.
    Preimage(PreimageError),
}

impl fmt::Display for WalkerBuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalkerBuilderError::InvalidSeedAddress(err) => write!(f, "Invalid seed address: {err}"),
            WalkerBuilderError::Preimage(err) => write!(f, "Invalid preimage table: {err}"),
        }
    }
}

impl std::error::Error for WalkerBuilderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WalkerBuilderError::InvalidSeedAddress(err) => Some(err),
            WalkerBuilderError::Preimage(err) => Some(err),
        }
    }
}

/// The default bootstrap nodes as routing records.
pub fn default_seeds() -> Result<Vec<AddrInfo>, AddrInfoError> {
    DEFAULT_BOOTSTRAP_ADDRS
        .iter()
        .map(|addr| AddrInfo::parse(addr))
        .collect()
}

/// Builder for creating a customized [`Walker`] instance.
///
/// # Example
///
/// ```
/// # fn main() -> Result<(), dht_peers_walker::WalkerBuilderError> {
/// use dht_peers_walker::{MemoryTransport, WalkerBuilder};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let transport = Arc::new(MemoryTransport::new());
/// let walker = WalkerBuilder::new(transport)
///     .with_seed_addrs(&[
///         "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
///     ])?
///     .with_concurrency(16)
///     .with_connect_timeout(Duration::from_secs(3))
///     .with_prefix_bits(8)
///     .build()?;
/// assert_eq!(walker.seeds().len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct WalkerBuilder<T> {
    /// Transport used to reach peers.
    transport: Arc<T>,
    /// Timeout for dialing a peer.
    connect_timeout: Duration,
    /// Timeout for all requests to one peer.
    request_timeout: Duration,
    /// Minimum gap between dispatches.
    dispatch_interval: Duration,
    /// Number of worker tasks.
    concurrency: usize,
    /// Seeds, the bootstrap nodes if None.
    seeds: Option<Vec<AddrInfo>>,
    /// Observers of every outcome.
    observers: Vec<Arc<dyn Observer>>,
    /// Filter for discovered addresses.
    address_filter: AddressFilter,
    /// Shared precomputed table, generated on build if None.
    preimage_table: Option<Arc<PreimageTable>>,
    /// Width of a generated table.
    prefix_bits: u32,
}

impl<T: Transport> WalkerBuilder<T> {
    /// Create a new walker builder.
    ///
    /// # Arguments
    ///
    /// * `transport` - The transport the walker dials and queries peers through.
    pub fn new(transport: Arc<T>) -> Self {
        WalkerBuilder {
            transport,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            dispatch_interval: DEFAULT_DISPATCH_INTERVAL,
            concurrency: DEFAULT_CONCURRENCY,
            seeds: None,
            observers: Vec::new(),
            address_filter: AddressFilter::default(),
            preimage_table: None,
            prefix_bits: DEFAULT_PREFIX_BITS,
        }
    }

    /// Set the timeout for dialing a peer (defaults to 5 seconds).
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the timeout for dumping a connected peer's buckets.
    ///
    /// One deadline covers every closest-peers request sent to a peer
    /// (defaults to 25 seconds).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the minimum gap between handing two peers to workers.
    ///
    /// Spreads dials out instead of bursting (defaults to 20 milliseconds).
    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    /// Set how many peers are walked concurrently.
    ///
    /// # Recommendations
    ///
    /// * **Conservative (8-32)** - Constrained hosts or rate limited networks.
    /// * **Default (128)** - Walks the public IPFS DHT in minutes.
    ///
    /// Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the seeds the walk starts from, replacing the bootstrap nodes.
    pub fn with_seeds(mut self, seeds: Vec<AddrInfo>) -> Self {
        self.seeds = Some(seeds);
        self
    }

    /// Set the seeds from `/.../p2p/<peer id>` multiaddrs.
    ///
    /// # Returns
    ///
    /// * `Ok(Self)` - The builder for method chaining if every address parses.
    /// * `Err(WalkerBuilderError)` - If an address is invalid.
    pub fn with_seed_addrs(mut self, addrs: &[&str]) -> Result<Self, WalkerBuilderError> {
        let seeds = addrs
            .iter()
            .map(|addr| AddrInfo::parse(addr))
            .collect::<Result<Vec<_>, _>>()
            .map_err(WalkerBuilderError::InvalidSeedAddress)?;
        self.seeds = Some(seeds);
        Ok(self)
    }

    /// Add an observer of walk outcomes.
    ///
    /// May be called repeatedly, observers are called in the order added.
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Set the filter applied to discovered addresses (defaults to public only).
    pub fn with_address_filter(mut self, filter: AddressFilter) -> Self {
        self.address_filter = filter;
        self
    }

    /// Use an existing preimage table instead of generating one.
    pub fn with_preimage_table(mut self, table: Arc<PreimageTable>) -> Self {
        self.preimage_table = Some(table);
        self
    }

    /// Set the width of the generated preimage table (defaults to 16 bits).
    ///
    /// Walkers left at the default width share one table per process.
    ///
    /// Ignored when a table is supplied with [`WalkerBuilder::with_preimage_table`].
    pub fn with_prefix_bits(mut self, bits: u32) -> Self {
        self.prefix_bits = bits;
        self
    }

    /// Build the walker with the configured options.
    ///
    /// Generating a preimage table is CPU bound and blocks the calling thread.
    ///
    /// # Returns
    ///
    /// * `Ok(Walker)` - A configured walker.
    /// * `Err(WalkerBuilderError)` - If the seeds or preimage table are invalid.
    pub fn build(self) -> Result<Walker<T>, WalkerBuilderError> {
        let table = match self.preimage_table {
            Some(table) => table,
            None if self.prefix_bits == DEFAULT_PREFIX_BITS => {
                PreimageTable::shared_default().map_err(WalkerBuilderError::Preimage)?
            }
            None => Arc::new(
                PreimageTable::generate_with_bits(self.prefix_bits)
                    .map_err(WalkerBuilderError::Preimage)?,
            ),
        };

        let seeds = match self.seeds {
            Some(seeds) => seeds,
            None => default_seeds().map_err(WalkerBuilderError::InvalidSeedAddress)?,
        };

        let mut observers = self.observers;
        let observer: Arc<dyn Observer> = match observers.len() {
            0 => Arc::new(NullObserver),
            1 => observers.remove(0),
            _ => Arc::new(MultiObserver::new(observers)),
        };

        let session = WalkSession::new(
            self.transport,
            table,
            SessionConfig {
                connect_timeout: self.connect_timeout,
                request_timeout: self.request_timeout,
                dispatch_interval: self.dispatch_interval,
                concurrency: self.concurrency.max(1),
                address_filter: self.address_filter,
            },
        );

        Ok(Walker::new(session, seeds, observer))
    }
}

impl<T> fmt::Debug for WalkerBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalkerBuilder")
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("dispatch_interval", &self.dispatch_interval)
            .field("concurrency", &self.concurrency)
            .field("seeds", &self.seeds)
            .field("observers", &self.observers.len())
            .field("address_filter", &self.address_filter)
            .field("preimage_table", &self.preimage_table)
            .field("prefix_bits", &self.prefix_bits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;

    #[test]
    fn test_default_seeds_parse() {
        let seeds = default_seeds().unwrap();
        assert_eq!(seeds.len(), DEFAULT_BOOTSTRAP_ADDRS.len());
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let walker = WalkerBuilder::new(Arc::new(MemoryTransport::new()))
            .with_concurrency(0)
            .with_prefix_bits(4)
            .build()
            .unwrap();
        assert_eq!(walker.concurrency(), 1);
    }

    #[test]
    fn test_invalid_seed_address() {
        let result = WalkerBuilder::new(Arc::new(MemoryTransport::new()))
            .with_seed_addrs(&["/ip4/127.0.0.1/tcp/4001"]);
        assert!(matches!(
            result,
            Err(WalkerBuilderError::InvalidSeedAddress(AddrInfoError::MissingPeerId(_)))
        ));
    }

    #[test]
    fn test_invalid_prefix_bits() {
        let result = WalkerBuilder::new(Arc::new(MemoryTransport::new()))
            .with_prefix_bits(0)
            .build();
        assert!(matches!(
            result,
            Err(WalkerBuilderError::Preimage(PreimageError::InvalidWidth(0)))
        ));
    }

    #[test]
    fn test_shared_table_is_reused() {
        let table = Arc::new(PreimageTable::generate_with_bits(4).unwrap());
        let walker = WalkerBuilder::new(Arc::new(MemoryTransport::new()))
            .with_preimage_table(table.clone())
            .with_seeds(Vec::new())
            .build()
            .unwrap();
        assert!(Arc::ptr_eq(walker.preimage_table(), &table));
        assert!(walker.seeds().is_empty());
    }
}
