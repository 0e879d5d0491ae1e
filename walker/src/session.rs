//! Internal session coordination for walking operations.
//!
//! This module contains the [`WalkSession`] which runs one walk by owning the
//! work queue and feeding a fixed pool of worker tasks.

use crate::error::{PeerFailure, WalkError};
use crate::filter::AddressFilter;
use crate::observer::Observer;
use crate::peer::{AddrInfo, CrawlError, Peer, RequestSample, WalkResult};
use crate::preimage::PreimageTable;
use crate::shutdown::ShutdownSignal;
use crate::transport::Transport;
use libp2p::PeerId;
use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout_at, Instant};

/// How often the coordinator reports progress.
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);
/// Stand-in deadline for durations too long to add to an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `Instant::now() + after`, saturating far in the future.
fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after).unwrap_or(now + FAR_FUTURE)
}

/// Peers whose worker panicked before reporting a result.
type LostPeers = Arc<std::sync::Mutex<Vec<PeerId>>>;

/// Records its peer as lost if dropped while the worker is unwinding.
struct InFlight<'a> {
    id: PeerId,
    lost: &'a LostPeers,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.lost
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(self.id);
        }
    }
}

/// Configuration for a walk session.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub dispatch_interval: Duration,
    pub concurrency: usize,
    pub address_filter: AddressFilter,
}

/// Why a bounded operation did not produce its output.
enum Interrupted {
    TimedOut,
    Cancelled,
}

/// Run `fut` until `deadline` or until `shutdown` fires.
async fn bounded<F: Future>(
    deadline: Instant,
    shutdown: &ShutdownSignal,
    fut: F,
) -> Result<F::Output, Interrupted> {
    tokio::select! {
        biased;

        _ = shutdown.cancelled() => Err(Interrupted::Cancelled),
        output = timeout_at(deadline, fut) => output.map_err(|_| Interrupted::TimedOut),
    }
}

/// Internal coordinator for a walk.
///
/// # Architecture
///
/// * **Coordinator** (`coordinate()`) - Owns the pending queue, the set of
///   queried peers, and the count of outstanding work. Nothing else touches them.
/// * **Workers** (`work()`) - Pull peer ids from a shared work channel, walk
///   them with `process()`, and hand back one result at a time.
pub(crate) struct WalkSession<T> {
    transport: Arc<T>,
    table: Arc<PreimageTable>,
    config: Arc<SessionConfig>,
}

impl<T> Clone for WalkSession<T> {
    fn clone(&self) -> Self {
        WalkSession {
            transport: self.transport.clone(),
            table: self.table.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: Transport> WalkSession<T> {
    pub fn new(transport: Arc<T>, table: Arc<PreimageTable>, config: SessionConfig) -> Self {
        WalkSession {
            transport,
            table,
            config: Arc::new(config),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn table(&self) -> &Arc<PreimageTable> {
        &self.table
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Walks a single peer: connects, dumps its buckets, and reads its metadata.
    ///
    /// # Arguments
    ///
    /// * `id` - The peer to walk, its addresses must already be known to the transport.
    /// * `shutdown` - Aborts the connect or any request in flight.
    pub async fn process(&self, id: PeerId, shutdown: &ShutdownSignal) -> WalkResult {
        debug!("Walking peer {id}");

        let started = SystemTime::now();
        let addresses = self.transport.addresses(&id);
        let fail = |cause: PeerFailure| CrawlError {
            id,
            addresses: addresses.clone(),
            time: started,
            cause,
        };

        let info = AddrInfo::new(id, addresses.clone());
        let connect_start = SystemTime::now();
        let connect_clock = Instant::now();
        match bounded(
            deadline_after(self.config.connect_timeout),
            shutdown,
            self.transport.connect(&info),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(fail(PeerFailure::Connect(err))),
            Err(Interrupted::TimedOut) => return Err(fail(PeerFailure::ConnectTimeout)),
            Err(Interrupted::Cancelled) => return Err(fail(PeerFailure::Cancelled)),
        }
        let connect_duration = connect_clock.elapsed();

        let probed = self.probe_buckets(&id, shutdown).await;

        // Learned during the connection, may be missing.
        let agent = self.transport.agent_version(&id).unwrap_or_default();
        let protocols = self.transport.protocols(&id).unwrap_or_default();
        self.transport.close_peer(&id);

        let (buckets, requests) = probed.map_err(fail)?;
        debug!("Walked peer {id}, {} buckets", buckets.len());

        Ok(Peer {
            id,
            addresses,
            agent,
            protocols,
            buckets,
            requests,
            connect_start,
            connect_duration,
        })
    }

    /// Requests one bucket per preimage target until a bucket adds nothing new.
    ///
    /// All requests share one deadline.
    async fn probe_buckets(
        &self,
        id: &PeerId,
        shutdown: &ShutdownSignal,
    ) -> Result<(Vec<Vec<AddrInfo>>, Vec<RequestSample>), PeerFailure> {
        let deadline = deadline_after(self.config.request_timeout);
        let mut seen: HashSet<PeerId> = HashSet::new();
        let mut buckets = Vec::new();
        let mut requests = Vec::new();

        for target in self.table.targets_for(id) {
            let start = SystemTime::now();
            let clock = Instant::now();
            let entries =
                match bounded(deadline, shutdown, self.transport.closest_peers(id, &target)).await {
                    Ok(Ok(entries)) => entries,
                    Ok(Err(err)) => return Err(PeerFailure::Request(err)),
                    Err(Interrupted::TimedOut) => return Err(PeerFailure::RequestTimeout),
                    Err(Interrupted::Cancelled) => return Err(PeerFailure::Cancelled),
                };
            requests.push(RequestSample {
                start,
                duration: clock.elapsed(),
            });

            // Deeper buckets only get emptier, stop once nothing new shows up.
            let before = seen.len();
            seen.extend(entries.iter().map(|entry| entry.id));
            if seen.len() == before {
                break;
            }
            buckets.push(entries);
        }

        Ok((buckets, requests))
    }

    /// Worker loop, runs until the work channel closes or the walk is cancelled.
    async fn work(
        self,
        work_rx: Arc<Mutex<mpsc::Receiver<PeerId>>>,
        result_tx: mpsc::Sender<WalkResult>,
        lost: LostPeers,
        shutdown: ShutdownSignal,
    ) {
        loop {
            let next = tokio::select! {
                biased;

                _ = shutdown.cancelled() => None,
                id = async { work_rx.lock().await.recv().await } => id,
            };
            let Some(id) = next else {
                break;
            };

            let in_flight = InFlight { id, lost: &lost };
            let result = self.process(id, &shutdown).await;
            drop(in_flight);
            if result_tx.send(result).await.is_err() {
                // Coordinator is gone.
                break;
            }
        }
    }

    /// Coordinates the walk by managing the work queue and collecting results.
    ///
    /// # Termination Conditions
    ///
    /// 1. **Natural Completion** - Nothing pending and nothing in flight.
    /// 2. **Cancellation** - The shutdown signal fired, pending work is abandoned.
    ///
    /// # Arguments
    ///
    /// * `seeds` - Peers to start from.
    /// * `observer` - Receives every outcome, called from this task only.
    /// * `shutdown` - Cancels the walk.
    pub async fn coordinate(
        &self,
        seeds: &[AddrInfo],
        observer: &dyn Observer,
        shutdown: &ShutdownSignal,
    ) -> Result<(), WalkError> {
        if shutdown.is_shutdown() {
            return Err(WalkError::Cancelled);
        }

        let mut pending: VecDeque<PeerId> = VecDeque::new();
        let mut queried: HashSet<PeerId> = HashSet::new();
        for seed in seeds {
            self.transport.add_addresses(&seed.id, &seed.addrs);
            if queried.insert(seed.id) {
                pending.push_back(seed.id);
            }
        }
        if pending.is_empty() {
            debug!("No seeds to walk");
            return Ok(());
        }

        // Capacity 1 for results so each worker has at most one unconsumed result.
        let (work_tx, work_rx) = mpsc::channel::<PeerId>(1);
        let (result_tx, mut result_rx) = mpsc::channel::<WalkResult>(1);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let lost: LostPeers = Arc::default();

        let mut workers = JoinSet::new();
        for _ in 0..self.config.concurrency {
            let session = self.clone();
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let lost = lost.clone();
            let shutdown = shutdown.clone();
            workers.spawn(session.work(work_rx, result_tx, lost, shutdown));
        }
        drop(work_rx);
        drop(result_tx);

        let mut inprogress: usize = 0;
        let mut walked: usize = 0;
        let mut failed: usize = 0;
        let mut next_dispatch = Instant::now();
        let mut last_log_time = Instant::now();

        let outcome = loop {
            if pending.is_empty() && inprogress == 0 {
                info!("Walk exhausted - {walked} peers walked, {failed} failed");
                break Ok(());
            }

            // Periodic status logging, only checked between events.
            if last_log_time.elapsed() >= STATUS_LOG_INTERVAL {
                info!(
                    "{} in progress (max: {}), {} pending, {} queried, {} walked, {} failed",
                    inprogress,
                    self.config.concurrency,
                    pending.len(),
                    queried.len(),
                    walked,
                    failed
                );
                last_log_time = Instant::now();
            }

            let dispatch_at = next_dispatch;
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Walk cancelled with {} pending, {} in progress", pending.len(), inprogress);
                    break Err(WalkError::Cancelled);
                }
                Some(joined) = workers.join_next() => {
                    // Workers only stop early by panicking.
                    if let Err(err) = joined {
                        warn!("Walk worker stopped: {err}");
                    }
                    let lost_ids = std::mem::take(
                        &mut *lost.lock().unwrap_or_else(PoisonError::into_inner),
                    );
                    for id in lost_ids {
                        inprogress -= 1;
                        failed += 1;
                        let error = CrawlError {
                            id,
                            addresses: self.transport.addresses(&id),
                            time: SystemTime::now(),
                            cause: PeerFailure::WorkerPanicked,
                        };
                        debug!("Failed to walk {error}");
                        observer.observe_error(&error);
                    }
                }
                result = result_rx.recv() => {
                    let Some(result) = result else {
                        break Err(WalkError::WorkersExited);
                    };
                    inprogress -= 1;
                    match result {
                        Ok(peer) => {
                            walked += 1;
                            observer.observe_peer(&peer);
                            for entry in peer.routing_table() {
                                if queried.insert(entry.id) {
                                    let addrs = self.config.address_filter.apply(&entry.addrs);
                                    self.transport.add_addresses(&entry.id, &addrs);
                                    pending.push_back(entry.id);
                                }
                            }
                        }
                        Err(error) => {
                            failed += 1;
                            debug!("Failed to walk {error}");
                            observer.observe_error(&error);
                        }
                    }
                }
                permit = async {
                    sleep_until(dispatch_at).await;
                    work_tx.reserve().await
                }, if !pending.is_empty() => {
                    let Ok(permit) = permit else {
                        break Err(WalkError::WorkersExited);
                    };
                    if let Some(id) = pending.pop_front() {
                        permit.send(id);
                        inprogress += 1;
                        next_dispatch = deadline_after(self.config.dispatch_interval);
                    }
                }
            }
        };

        // Closing both channels releases idle workers and any blocked on a send.
        drop(work_tx);
        drop(result_rx);
        while workers.join_next().await.is_some() {}

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::memory::{MemoryTransport, SimulatedNode};
    use crate::observer::CollectorObserver;
    use crate::shutdown::shutdown_channel;
    use libp2p::Multiaddr;
    use tokio::time::timeout;

    fn session<T: Transport>(transport: Arc<T>, table: Arc<PreimageTable>) -> WalkSession<T> {
        WalkSession::new(
            transport,
            table,
            SessionConfig {
                connect_timeout: Duration::from_millis(200),
                request_timeout: Duration::from_millis(200),
                dispatch_interval: Duration::ZERO,
                concurrency: 4,
                address_filter: AddressFilter::AllowAll,
            },
        )
    }

    fn entry(n: u8) -> AddrInfo {
        let addr: Multiaddr = format!("/ip4/203.0.113.{n}/tcp/4001").parse().unwrap();
        AddrInfo::new(PeerId::random(), vec![addr])
    }

    #[tokio::test]
    async fn test_process_stops_when_bucket_adds_nothing() {
        let table = Arc::new(PreimageTable::generate_with_bits(8).unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let id = PeerId::random();
        let (d, e, f) = (entry(1), entry(2), entry(3));
        transport.add_node(
            id,
            SimulatedNode::new()
                .with_agent("kubo/0.24.0")
                .with_protocol("/ipfs/kad/1.0.0")
                .with_bucket(0, vec![d.clone()])
                .with_bucket(1, vec![e.clone(), f.clone()])
                .with_bucket(3, vec![entry(4)]),
        );

        let peer = session(transport.clone(), table)
            .process(id, &ShutdownSignal::never())
            .await
            .unwrap();

        // Bucket 2 is empty so bucket 3 is never asked for.
        assert_eq!(peer.buckets, vec![vec![d], vec![e, f]]);
        assert_eq!(peer.requests.len(), 3);
        assert_eq!(transport.requests(), 3);
        assert_eq!(peer.agent, "kubo/0.24.0");
        assert_eq!(peer.protocols, vec!["/ipfs/kad/1.0.0".to_string()]);
        assert!(transport.connected().is_empty());
    }

    #[tokio::test]
    async fn test_process_missing_metadata_is_empty() {
        let table = Arc::new(PreimageTable::generate_with_bits(4).unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let id = PeerId::random();
        transport.add_node(id, SimulatedNode::new());

        let peer = session(transport, table)
            .process(id, &ShutdownSignal::never())
            .await
            .unwrap();

        assert!(peer.agent.is_empty());
        assert!(peer.protocols.is_empty());
        assert!(peer.buckets.is_empty());
        assert_eq!(peer.requests.len(), 1);
    }

    #[tokio::test]
    async fn test_process_connect_failure() {
        let table = Arc::new(PreimageTable::generate_with_bits(4).unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let id = PeerId::random();
        let addr: Multiaddr = "/ip4/198.51.100.7/tcp/4001".parse().unwrap();
        transport.add_addresses(&id, &[addr.clone()]);
        transport.add_node(id, SimulatedNode::new().unreachable());

        let error = session(transport, table)
            .process(id, &ShutdownSignal::never())
            .await
            .unwrap_err();

        assert_eq!(error.id, id);
        assert_eq!(error.addresses, vec![addr]);
        assert!(matches!(
            error.cause,
            PeerFailure::Connect(TransportError::Unreachable)
        ));
    }

    #[tokio::test]
    async fn test_process_connect_timeout() {
        let table = Arc::new(PreimageTable::generate_with_bits(4).unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let id = PeerId::random();
        transport.add_node(id, SimulatedNode::new().with_latency(Duration::from_secs(5)));

        let error = session(transport, table)
            .process(id, &ShutdownSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(error.cause, PeerFailure::ConnectTimeout));
    }

    #[tokio::test]
    async fn test_process_cancelled() {
        let table = Arc::new(PreimageTable::generate_with_bits(4).unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let id = PeerId::random();
        transport.add_node(id, SimulatedNode::new().with_latency(Duration::from_secs(5)));
        let (trigger, signal) = shutdown_channel();
        trigger.trigger();

        let error = session(transport, table)
            .process(id, &signal)
            .await
            .unwrap_err();

        assert!(matches!(error.cause, PeerFailure::Cancelled));
    }

    #[tokio::test]
    async fn test_process_request_failure_closes_peer() {
        let table = Arc::new(PreimageTable::generate_with_bits(8).unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let id = PeerId::random();
        transport.add_node(
            id,
            SimulatedNode::new()
                .with_bucket(0, vec![entry(1)])
                .with_bucket(1, vec![entry(2)])
                .with_request_failure(1),
        );

        let error = session(transport.clone(), table)
            .process(id, &ShutdownSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(
            error.cause,
            PeerFailure::Request(TransportError::Protocol(_))
        ));
        assert_eq!(transport.requests(), 2);
        assert!(transport.connected().is_empty());
    }

    #[tokio::test]
    async fn test_process_request_timeout_discards_buckets() {
        let table = Arc::new(PreimageTable::generate_with_bits(8).unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let id = PeerId::random();
        // Two requests fit in the shared 200ms budget, the third does not.
        transport.add_node(
            id,
            SimulatedNode::new()
                .with_bucket(0, vec![entry(1)])
                .with_bucket(1, vec![entry(2)])
                .with_bucket(2, vec![entry(3)])
                .with_bucket(3, vec![entry(4)])
                .with_request_latency(Duration::from_millis(90)),
        );

        let error = session(transport.clone(), table)
            .process(id, &ShutdownSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(error.cause, PeerFailure::RequestTimeout));
        assert!(transport.connected().is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_durations_do_not_overflow() {
        let table = Arc::new(PreimageTable::generate_with_bits(4).unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let seed = entry(1);
        transport.add_node(seed.id, SimulatedNode::new());
        let session = WalkSession::new(
            transport,
            table,
            SessionConfig {
                connect_timeout: Duration::MAX,
                request_timeout: Duration::MAX,
                dispatch_interval: Duration::MAX,
                concurrency: 2,
                address_filter: AddressFilter::AllowAll,
            },
        );
        let observer = CollectorObserver::new();

        let result = timeout(
            Duration::from_secs(5),
            session.coordinate(&[seed.clone()], &observer, &ShutdownSignal::never()),
        )
        .await
        .unwrap();

        assert_eq!(result, Ok(()));
        assert_eq!(observer.peers().len(), 1);
        assert_eq!(observer.peers()[0].id, seed.id);
    }

    /// Panics while dialing one chosen peer.
    struct PanickingTransport {
        inner: MemoryTransport,
        poisoned: PeerId,
    }

    impl Transport for PanickingTransport {
        async fn connect(&self, peer: &AddrInfo) -> Result<(), TransportError> {
            if peer.id == self.poisoned {
                panic!("dial exploded");
            }
            self.inner.connect(peer).await
        }

        async fn closest_peers(
            &self,
            peer: &PeerId,
            key: &PeerId,
        ) -> Result<Vec<AddrInfo>, TransportError> {
            self.inner.closest_peers(peer, key).await
        }

        fn add_addresses(&self, peer: &PeerId, addrs: &[Multiaddr]) {
            self.inner.add_addresses(peer, addrs)
        }

        fn addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
            self.inner.addresses(peer)
        }

        fn agent_version(&self, peer: &PeerId) -> Option<String> {
            self.inner.agent_version(peer)
        }

        fn protocols(&self, peer: &PeerId) -> Option<Vec<String>> {
            self.inner.protocols(peer)
        }

        fn close_peer(&self, peer: &PeerId) {
            self.inner.close_peer(peer)
        }
    }

    fn panicking(concurrency: usize) -> (WalkSession<PanickingTransport>, AddrInfo, AddrInfo) {
        let (bad, good) = (entry(1), entry(2));
        let inner = MemoryTransport::new();
        inner.add_node(bad.id, SimulatedNode::new());
        inner.add_node(good.id, SimulatedNode::new());
        let transport = Arc::new(PanickingTransport {
            inner,
            poisoned: bad.id,
        });
        let table = Arc::new(PreimageTable::generate_with_bits(4).unwrap());
        let mut session = session(transport, table);
        Arc::make_mut(&mut session.config).concurrency = concurrency;
        (session, bad, good)
    }

    #[tokio::test]
    async fn test_worker_panic_is_reported_as_peer_error() {
        let (session, bad, good) = panicking(2);
        let observer = CollectorObserver::new();

        let result = timeout(
            Duration::from_secs(5),
            session.coordinate(&[bad.clone(), good.clone()], &observer, &ShutdownSignal::never()),
        )
        .await
        .unwrap();

        assert_eq!(result, Ok(()));
        assert_eq!(observer.errors(), vec![(bad.id, "Worker panicked".to_string())]);
        let peers = observer.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, good.id);
    }

    #[tokio::test]
    async fn test_walk_ends_when_every_worker_panicked() {
        let (session, bad, good) = panicking(1);
        let observer = CollectorObserver::new();

        let result = timeout(
            Duration::from_secs(5),
            session.coordinate(&[bad.clone(), good], &observer, &ShutdownSignal::never()),
        )
        .await
        .unwrap();

        assert_eq!(result, Err(WalkError::WorkersExited));
        assert_eq!(observer.errors(), vec![(bad.id, "Worker panicked".to_string())]);
        assert!(observer.peers().is_empty());
    }
}
