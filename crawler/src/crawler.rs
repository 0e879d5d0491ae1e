use crate::metrics::{Metrics, MetricsSnapshot, PassCounts};
use crate::observer::CrawlObserver;
use crate::subscription::Subscription;
use dht_peers_walker::{
    CrawlError, Observer, Peer, PeerId, ShutdownSignal, Transport, WalkError, Walker,
};
use log::{debug, info};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Outcome of one completed crawl pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    /// Counts for the pass.
    pub counts: PassCounts,
    /// Wall time the pass took.
    pub duration: Duration,
}

/// Membership of the pass in progress plus the subscriber registry.
///
/// Guarded by one lock so a new subscriber's snapshot and its registration
/// happen atomically with respect to broadcasts.
#[derive(Default)]
struct Generation {
    peers: HashSet<PeerId>,
    telemetry_peers: HashSet<PeerId>,
    subscribers: HashMap<u64, mpsc::Sender<PeerId>>,
    next_subscriber: u64,
}

impl Generation {
    /// Offer a peer to every subscriber without waiting.
    fn broadcast(&mut self, id: PeerId) {
        self.subscribers.retain(|subscriber, tx| match tx.try_send(id) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Subscriber {subscriber} is full, dropping {id}");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

/// State shared between a [`Crawler`], its walker, and its subscriptions.
///
/// Only the walker's observer callbacks write membership.
pub(crate) struct CrawlState {
    generation: Mutex<Generation>,
    metrics: Metrics,
    telemetry_protocol: String,
    subscriber_capacity: usize,
    observers: Vec<Arc<dyn CrawlObserver>>,
}

impl CrawlState {
    pub(crate) fn new(
        telemetry_protocol: String,
        subscriber_capacity: usize,
        observers: Vec<Arc<dyn CrawlObserver>>,
    ) -> Self {
        CrawlState {
            generation: Mutex::new(Generation::default()),
            metrics: Metrics::default(),
            telemetry_protocol,
            subscriber_capacity: subscriber_capacity.max(1),
            observers,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Generation> {
        self.generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let mut generation = self.lock();
        let id = generation.next_subscriber;
        generation.next_subscriber += 1;
        generation.subscribers.insert(id, tx);
        let backlog: VecDeque<PeerId> = generation.telemetry_peers.iter().copied().collect();
        drop(generation);

        debug!("Subscriber {id} registered with {} known peers", backlog.len());
        Subscription::new(backlog, rx, Arc::downgrade(self), id)
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        if self.lock().subscribers.remove(&id).is_some() {
            debug!("Subscriber {id} unregistered");
        }
    }

    /// Drop every subscriber's sender so their streams end.
    fn close_subscriptions(&self) {
        let closed = std::mem::take(&mut self.lock().subscribers);
        debug!("Closed {} subscriptions", closed.len());
    }

    fn crawl_begin(&self) {
        for observer in &self.observers {
            observer.crawl_begin();
        }
    }

    fn crawl_end(&self) {
        for observer in &self.observers {
            observer.crawl_end();
        }
    }

    /// Rotate the counters and start a fresh generation.
    fn end_generation(&self) -> PassCounts {
        let mut generation = self.lock();
        generation.peers.clear();
        generation.telemetry_peers.clear();
        self.metrics.complete_pass()
    }
}

impl Observer for CrawlState {
    fn observe_peer(&self, peer: &Peer) {
        let telemetry = peer.supports_protocol(&self.telemetry_protocol);
        {
            let mut generation = self.lock();
            if generation.peers.insert(peer.id) {
                self.metrics.record_peer();
            }
            if telemetry && generation.telemetry_peers.insert(peer.id) {
                self.metrics.record_telemetry_peer();
                generation.broadcast(peer.id);
            }
        }

        for observer in &self.observers {
            observer.observe_peer(peer);
        }

        if telemetry {
            info!("Found telemetry peer {}", peer.id);
        }
    }

    fn observe_error(&self, error: &CrawlError) {
        self.metrics.record_error();
        for observer in &self.observers {
            observer.observe_error(error);
        }
        debug!("Error {error}");
    }
}

/// Continuously walks the DHT, tracking telemetry-capable peers per pass.
///
/// Each pass walks every reachable peer once. Subscribers learn about a
/// telemetry peer the first time it is seen in a pass.
pub struct Crawler<T> {
    walker: Walker<T>,
    state: Arc<CrawlState>,
    pass_delay: Duration,
}

impl<T: Transport> Crawler<T> {
    pub(crate) fn new(walker: Walker<T>, state: Arc<CrawlState>, pass_delay: Duration) -> Self {
        Crawler {
            walker,
            state,
            pass_delay,
        }
    }

    /// Crawl pass after pass until the signal fires.
    ///
    /// Every subscription ends when this returns.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The crawl was cancelled.
    /// * `Err(WalkError)` - A pass failed for a reason other than cancellation.
    pub async fn run(&self, shutdown: &ShutdownSignal) -> Result<(), WalkError> {
        let result = loop {
            if shutdown.is_shutdown() {
                break Ok(());
            }

            match self.crawl_once(shutdown).await {
                Ok(summary) => {
                    info!(
                        "Crawl pass finished in {:?} - {} peers, {} telemetry peers, {} errors",
                        summary.duration,
                        summary.counts.peers,
                        summary.counts.telemetry_peers,
                        summary.counts.errors
                    );
                }
                Err(WalkError::Cancelled) => break Ok(()),
                Err(err) => break Err(err),
            }

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.pass_delay) => {}
            }
            tokio::task::yield_now().await;
        };

        info!("Crawler stopping");
        self.state.close_subscriptions();
        result
    }

    /// Run a single pass and reset the generation afterwards.
    ///
    /// A cancelled pass leaves the generation and counters untouched.
    pub async fn crawl_once(&self, shutdown: &ShutdownSignal) -> Result<PassSummary, WalkError> {
        info!(
            "Starting crawl pass {}",
            self.state.metrics.snapshot().completed + 1
        );
        self.state.crawl_begin();
        let started = Instant::now();

        self.walker.walk(shutdown).await?;

        self.state.crawl_end();
        let counts = self.state.end_generation();
        Ok(PassSummary {
            counts,
            duration: started.elapsed(),
        })
    }

    /// Subscribe to telemetry peers.
    pub fn subscribe(&self) -> Subscription {
        self.state.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.state.metrics.snapshot()
    }

    /// Telemetry peers found so far in the current pass.
    pub fn telemetry_peers(&self) -> Vec<PeerId> {
        self.state.lock().telemetry_peers.iter().copied().collect()
    }

    /// Number of registered subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn walker(&self) -> &Walker<T> {
        &self.walker
    }
}

impl<T> fmt::Debug for Crawler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crawler")
            .field("walker", &self.walker)
            .field("telemetry_protocol", &self.state.telemetry_protocol)
            .field("pass_delay", &self.pass_delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dht_peers_walker::{CollectorObserver, PeerFailure};
    use std::time::SystemTime;

    const TELEMETRY: &str = "/telemetry/telemetry/0.4.0";

    fn state(capacity: usize) -> Arc<CrawlState> {
        Arc::new(CrawlState::new(TELEMETRY.to_string(), capacity, Vec::new()))
    }

    fn peer(telemetry: bool) -> Peer {
        let mut protocols = vec!["/ipfs/kad/1.0.0".to_string()];
        if telemetry {
            protocols.push(TELEMETRY.to_string());
        }
        Peer {
            id: PeerId::random(),
            addresses: Vec::new(),
            agent: "kubo/0.24.0".to_string(),
            protocols,
            buckets: Vec::new(),
            requests: Vec::new(),
            connect_start: SystemTime::now(),
            connect_duration: Duration::ZERO,
        }
    }

    fn crawl_error() -> CrawlError {
        CrawlError {
            id: PeerId::random(),
            addresses: Vec::new(),
            time: SystemTime::now(),
            cause: PeerFailure::RequestTimeout,
        }
    }

    #[test]
    fn test_counts_first_membership_only() {
        let state = state(32);
        let telemetry = peer(true);
        let plain = peer(false);

        state.observe_peer(&telemetry);
        state.observe_peer(&telemetry);
        state.observe_peer(&plain);
        state.observe_error(&crawl_error());

        let current = state.metrics.snapshot().current;
        assert_eq!(current.peers, 2);
        assert_eq!(current.telemetry_peers, 1);
        assert_eq!(current.errors, 1);
    }

    #[test]
    fn test_error_does_not_touch_membership() {
        let state = state(32);
        state.observe_error(&crawl_error());

        let generation = state.lock();
        assert!(generation.peers.is_empty());
        assert!(generation.telemetry_peers.is_empty());
    }

    #[test]
    fn test_full_subscriber_does_not_block_others() {
        let state = state(32);
        let mut stalled = state.subscribe();
        let mut active = state.subscribe();

        let mut delivered = 0;
        for _ in 0..100 {
            state.observe_peer(&peer(true));
            while active.try_recv().is_ok() {
                delivered += 1;
            }
        }

        assert_eq!(delivered, 100);
        let mut buffered = 0;
        while stalled.try_recv().is_ok() {
            buffered += 1;
        }
        assert_eq!(buffered, 32);
        assert_eq!(state.lock().subscribers.len(), 2);
    }

    #[test]
    fn test_subscribe_replays_known_peers() {
        let state = state(32);
        let known = [peer(true), peer(true)];
        for p in &known {
            state.observe_peer(p);
        }
        state.observe_peer(&peer(false));

        let mut subscription = state.subscribe();
        let live = peer(true);
        state.observe_peer(&live);

        let mut received = Vec::new();
        while let Ok(id) = subscription.try_recv() {
            received.push(id);
        }

        assert_eq!(received.len(), 3);
        let replayed: HashSet<PeerId> = received[..2].iter().copied().collect();
        assert_eq!(replayed, known.iter().map(|p| p.id).collect());
        assert_eq!(received[2], live.id);
    }

    #[test]
    fn test_drop_unregisters() {
        let state = state(32);
        let subscription = state.subscribe();
        assert_eq!(state.lock().subscribers.len(), 1);

        drop(subscription);
        assert!(state.lock().subscribers.is_empty());
    }

    #[test]
    fn test_end_generation_resets_membership() {
        let state = state(32);
        let telemetry = peer(true);
        state.observe_peer(&telemetry);

        let counts = state.end_generation();
        assert_eq!(counts.peers, 1);
        assert_eq!(counts.telemetry_peers, 1);
        assert!(state.lock().telemetry_peers.is_empty());

        // Seen again in the next pass, so announced again.
        let mut subscription = state.subscribe();
        state.observe_peer(&telemetry);
        assert_eq!(subscription.try_recv(), Ok(telemetry.id));

        let snapshot = state.metrics.snapshot();
        assert_eq!(snapshot.current.peers, 1);
        assert_eq!(snapshot.last.peers, 1);
        assert_eq!(snapshot.completed, 1);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let state = state(32);
        let mut subscription = state.subscribe();
        state.observe_peer(&peer(true));

        state.close_subscriptions();

        assert!(subscription.recv().await.is_some());
        assert_eq!(subscription.recv().await, None);
    }

    #[test]
    fn test_forwards_to_crawl_observers() {
        let collector = Arc::new(CollectorObserver::new());
        let observers: Vec<Arc<dyn CrawlObserver>> = vec![collector.clone()];
        let state = CrawlState::new(TELEMETRY.to_string(), 32, observers);

        state.observe_peer(&peer(false));
        state.observe_peer(&peer(true));
        state.observe_error(&crawl_error());

        assert_eq!(collector.peers().len(), 2);
        assert_eq!(collector.errors().len(), 1);
    }
}
