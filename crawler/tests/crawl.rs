use dht_peers_crawler::{
    shutdown_channel, AddrInfo, CrawlError, CrawlObserver, CrawlerBuilder, MemoryTransport,
    Multiaddr, Observer, Peer, PeerId, ShutdownSignal, ShutdownTrigger, SimulatedNode,
    WalkerBuilder, DEFAULT_TELEMETRY_PROTOCOL,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn addr_info(n: u8) -> AddrInfo {
    let addr: Multiaddr = format!("/ip4/198.51.100.{n}/tcp/4001").parse().unwrap();
    AddrInfo::new(PeerId::random(), vec![addr])
}

struct Network {
    transport: Arc<MemoryTransport>,
    seed: AddrInfo,
    telemetry: Vec<PeerId>,
    unreachable: PeerId,
}

/// A seed knowing two telemetry peers, a plain peer and an unreachable one.
fn network() -> Network {
    let transport = Arc::new(MemoryTransport::new());
    let seed = addr_info(1);
    let (t1, t2, plain, down) = (addr_info(2), addr_info(3), addr_info(4), addr_info(5));

    transport.add_node(
        seed.id,
        SimulatedNode::new()
            .with_bucket(0, vec![t1.clone(), plain.clone()])
            .with_bucket(1, vec![t2.clone(), down.clone()]),
    );
    for peer in [&t1, &t2] {
        transport.add_node(
            peer.id,
            SimulatedNode::new()
                .with_protocol("/ipfs/kad/1.0.0")
                .with_protocol(DEFAULT_TELEMETRY_PROTOCOL),
        );
    }
    transport.add_node(plain.id, SimulatedNode::new().with_protocol("/ipfs/kad/1.0.0"));
    transport.add_node(down.id, SimulatedNode::new().unreachable());

    Network {
        transport,
        seed,
        telemetry: vec![t1.id, t2.id],
        unreachable: down.id,
    }
}

fn walker(net: &Network) -> WalkerBuilder<MemoryTransport> {
    WalkerBuilder::new(net.transport.clone())
        .with_seeds(vec![net.seed.clone()])
        .with_prefix_bits(8)
        .with_concurrency(4)
        .with_dispatch_interval(Duration::ZERO)
        .with_connect_timeout(Duration::from_millis(500))
        .with_request_timeout(Duration::from_millis(500))
}

/// Counts pass hooks and fires a trigger once enough passes completed.
#[derive(Default)]
struct PassCounter {
    begins: AtomicUsize,
    ends: AtomicUsize,
    peers: AtomicUsize,
    errors: AtomicUsize,
    stop_after: Option<(usize, ShutdownTrigger)>,
}

impl Observer for PassCounter {
    fn observe_peer(&self, _peer: &Peer) {
        self.peers.fetch_add(1, Ordering::SeqCst);
    }

    fn observe_error(&self, _error: &CrawlError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

impl CrawlObserver for PassCounter {
    fn crawl_begin(&self) {
        self.begins.fetch_add(1, Ordering::SeqCst);
    }

    fn crawl_end(&self) {
        let ends = self.ends.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((passes, trigger)) = &self.stop_after {
            if ends >= *passes {
                trigger.trigger();
            }
        }
    }
}

#[tokio::test]
async fn test_crawl_once_counts_pass() {
    let net = network();
    let counter = Arc::new(PassCounter::default());
    let crawler = CrawlerBuilder::new(walker(&net))
        .with_observer(counter.clone())
        .build()
        .unwrap();

    let summary = crawler.crawl_once(&ShutdownSignal::never()).await.unwrap();

    assert_eq!(summary.counts.peers, 4);
    assert_eq!(summary.counts.telemetry_peers, 2);
    assert_eq!(summary.counts.errors, 1);
    assert_eq!(counter.begins.load(Ordering::SeqCst), 1);
    assert_eq!(counter.ends.load(Ordering::SeqCst), 1);
    assert_eq!(counter.peers.load(Ordering::SeqCst), 4);
    assert_eq!(counter.errors.load(Ordering::SeqCst), 1);
    assert_eq!(net.transport.connect_attempts(&net.unreachable), 1);

    let metrics = crawler.metrics();
    assert_eq!(metrics.last, summary.counts);
    assert_eq!(metrics.current.peers, 0);
    assert_eq!(metrics.completed, 1);
    assert!(crawler.telemetry_peers().is_empty());
}

#[tokio::test]
async fn test_each_pass_starts_fresh() {
    let net = network();
    let crawler = CrawlerBuilder::new(walker(&net)).build().unwrap();
    let mut subscription = crawler.subscribe();

    let first = crawler.crawl_once(&ShutdownSignal::never()).await.unwrap();
    let second = crawler.crawl_once(&ShutdownSignal::never()).await.unwrap();

    assert_eq!(first.counts, second.counts);
    assert_eq!(crawler.metrics().completed, 2);

    // Telemetry peers are announced once per pass.
    let mut announced = Vec::new();
    while let Ok(id) = subscription.try_recv() {
        announced.push(id);
    }
    assert_eq!(announced.len(), 4);
    let expected: HashSet<PeerId> = net.telemetry.iter().copied().collect();
    assert_eq!(announced.iter().copied().collect::<HashSet<_>>(), expected);
}

#[tokio::test]
async fn test_run_until_cancelled_by_observer() {
    let net = network();
    let (trigger, signal) = shutdown_channel();
    let counter = Arc::new(PassCounter {
        stop_after: Some((3, trigger)),
        ..PassCounter::default()
    });
    let crawler = CrawlerBuilder::new(walker(&net))
        .with_observer(counter.clone())
        .build()
        .unwrap();
    let mut subscription = crawler.subscribe();

    let result = timeout(Duration::from_secs(5), crawler.run(&signal))
        .await
        .unwrap();

    assert_eq!(result, Ok(()));
    assert_eq!(crawler.metrics().completed, 3);
    assert_eq!(counter.begins.load(Ordering::SeqCst), 3);

    // Stream ends after the buffered announcements.
    let mut announced = 0;
    while subscription.recv().await.is_some() {
        announced += 1;
    }
    assert_eq!(announced, 6);
    assert_eq!(crawler.subscriber_count(), 0);
}

#[tokio::test]
async fn test_run_cancelled_mid_pass() {
    let transport = Arc::new(MemoryTransport::new());
    let seeds: Vec<AddrInfo> = (1..=8).map(addr_info).collect();
    for seed in &seeds {
        transport.add_node(
            seed.id,
            SimulatedNode::new().with_latency(Duration::from_secs(10)),
        );
    }
    let counter = Arc::new(PassCounter::default());
    let crawler = CrawlerBuilder::new(
        WalkerBuilder::new(transport)
            .with_seeds(seeds)
            .with_prefix_bits(4)
            .with_connect_timeout(Duration::from_secs(30)),
    )
    .with_observer(counter.clone())
    .build()
    .unwrap();
    let mut subscription = crawler.subscribe();
    let (trigger, signal) = shutdown_channel();

    let cancel = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();
    };
    let (result, _) = timeout(Duration::from_secs(2), async {
        tokio::join!(crawler.run(&signal), cancel)
    })
    .await
    .unwrap();

    assert_eq!(result, Ok(()));
    assert_eq!(counter.begins.load(Ordering::SeqCst), 1);
    assert_eq!(counter.ends.load(Ordering::SeqCst), 0);
    assert_eq!(crawler.metrics().completed, 0);
    assert_eq!(subscription.recv().await, None);
}

#[tokio::test]
async fn test_run_with_fired_signal_does_nothing() {
    let net = network();
    let crawler = CrawlerBuilder::new(walker(&net)).build().unwrap();
    let (trigger, signal) = shutdown_channel();
    trigger.trigger();

    assert_eq!(crawler.run(&signal).await, Ok(()));
    assert_eq!(net.transport.total_connect_attempts(), 0);
}

#[tokio::test]
async fn test_custom_telemetry_protocol() {
    let net = network();
    let crawler = CrawlerBuilder::new(walker(&net))
        .with_telemetry_protocol("/ipfs/kad/1.0.0")
        .build()
        .unwrap();

    let summary = crawler.crawl_once(&ShutdownSignal::never()).await.unwrap();

    assert_eq!(summary.counts.telemetry_peers, 3);
}
