//! Observers of crawl passes.

use dht_peers_walker::{CollectorObserver, NullObserver, Observer};

/// An [`Observer`] that is also told when crawl passes begin and end.
///
/// The crawler forwards every peer and error it observes, whether or not the
/// peer supports telemetry.
pub trait CrawlObserver: Observer {
    /// A pass is about to start walking.
    fn crawl_begin(&self) {}
    /// A pass walked everything it could reach.
    ///
    /// Not called for a pass that was cancelled.
    fn crawl_end(&self) {}
}

impl CrawlObserver for NullObserver {}

impl CrawlObserver for CollectorObserver {}
