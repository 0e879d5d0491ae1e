//! Builder pattern for configuring and creating crawler instances.

use crate::crawler::{CrawlState, Crawler};
use crate::observer::CrawlObserver;
use dht_peers_walker::{Observer, Transport, WalkerBuilder, WalkerBuilderError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Protocol advertised by peers that serve telemetry.
pub const DEFAULT_TELEMETRY_PROTOCOL: &str = "/telemetry/telemetry/0.4.0";
/// Default queue size of each subscription.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 32;
/// Default pause between two passes.
pub const DEFAULT_PASS_DELAY: Duration = Duration::ZERO;

/// Errors that can occur during crawler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlerBuilderError {
    /// The underlying walker could not be built.
    Walker(WalkerBuilderError),
    /// The telemetry protocol is empty.
    EmptyTelemetryProtocol,
}

impl fmt::Display for CrawlerBuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlerBuilderError::Walker(err) => write!(f, "Invalid walker configuration: {err}"),
            CrawlerBuilderError::EmptyTelemetryProtocol => {
                write!(f, "Telemetry protocol must not be empty")
            }
        }
    }
}

impl std::error::Error for CrawlerBuilderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CrawlerBuilderError::Walker(err) => Some(err),
            CrawlerBuilderError::EmptyTelemetryProtocol => None,
        }
    }
}

impl From<WalkerBuilderError> for CrawlerBuilderError {
    fn from(err: WalkerBuilderError) -> Self {
        CrawlerBuilderError::Walker(err)
    }
}

/// Builder for creating a customized [`Crawler`] instance.
///
/// # Example
///
/// ```
/// # fn main() -> Result<(), dht_peers_crawler::CrawlerBuilderError> {
/// use dht_peers_crawler::{CrawlerBuilder, MemoryTransport, WalkerBuilder};
/// use std::sync::Arc;
///
/// let walker = WalkerBuilder::new(Arc::new(MemoryTransport::new()))
///     .with_seeds(Vec::new())
///     .with_prefix_bits(8);
///
/// let crawler = CrawlerBuilder::new(walker)
///     .with_subscriber_capacity(64)
///     .build()?;
/// assert_eq!(crawler.subscriber_count(), 0);
/// # Ok(())
/// # }
/// ```
pub struct CrawlerBuilder<T> {
    /// Walker configuration, the crawler adds itself as an observer.
    walker: WalkerBuilder<T>,
    /// Observers told about passes, peers and errors.
    observers: Vec<Arc<dyn CrawlObserver>>,
    /// Protocol identifying telemetry peers.
    telemetry_protocol: String,
    /// Queue size of each subscription.
    subscriber_capacity: usize,
    /// Pause between passes.
    pass_delay: Duration,
}

impl<T: Transport> CrawlerBuilder<T> {
    /// Create a new crawler builder on top of a walker configuration.
    pub fn new(walker: WalkerBuilder<T>) -> Self {
        CrawlerBuilder {
            walker,
            observers: Vec::new(),
            telemetry_protocol: DEFAULT_TELEMETRY_PROTOCOL.to_string(),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            pass_delay: DEFAULT_PASS_DELAY,
        }
    }

    /// Add an observer of passes, peers and errors.
    pub fn with_observer(mut self, observer: Arc<dyn CrawlObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Set the protocol that marks a peer as telemetry-capable.
    pub fn with_telemetry_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.telemetry_protocol = protocol.into();
        self
    }

    /// Set the queue size of each subscription (defaults to 32).
    ///
    /// Discoveries are dropped for a subscriber whose queue is full. Zero is
    /// treated as one.
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity.max(1);
        self
    }

    /// Set a pause between the end of a pass and the start of the next.
    pub fn with_pass_delay(mut self, delay: Duration) -> Self {
        self.pass_delay = delay;
        self
    }

    /// Build the crawler, building its walker first.
    ///
    /// # Returns
    ///
    /// * `Ok(Crawler)` - A configured crawler.
    /// * `Err(CrawlerBuilderError)` - If the walker or telemetry protocol are invalid.
    pub fn build(self) -> Result<Crawler<T>, CrawlerBuilderError> {
        if self.telemetry_protocol.is_empty() {
            return Err(CrawlerBuilderError::EmptyTelemetryProtocol);
        }

        let state = Arc::new(CrawlState::new(
            self.telemetry_protocol,
            self.subscriber_capacity,
            self.observers,
        ));
        let observer: Arc<dyn Observer> = state.clone();
        let walker = self.walker.with_observer(observer).build()?;

        Ok(Crawler::new(walker, state, self.pass_delay))
    }
}

impl<T> fmt::Debug for CrawlerBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrawlerBuilder")
            .field("walker", &self.walker)
            .field("observers", &self.observers.len())
            .field("telemetry_protocol", &self.telemetry_protocol)
            .field("subscriber_capacity", &self.subscriber_capacity)
            .field("pass_delay", &self.pass_delay)
            .finish()
    }
}
