//! Example of crawling a simulated DHT with the dht-peers crawler.

use clap::Parser;
use dht_peers_crawler::{
    shutdown_channel, AddrInfo, CrawlerBuilder, MemoryTransport, Multiaddr, PeerId,
    SimulatedNode, WalkerBuilder,
};
use log::LevelFilter;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes in the simulated network.
    #[arg(short, long, default_value = "500")]
    nodes: usize,

    /// Share of nodes advertising the telemetry protocol, from 0 to 1.
    #[arg(short, long, default_value = "0.2")]
    telemetry_ratio: f64,

    /// Share of nodes refusing dials, from 0 to 1.
    #[arg(short, long, default_value = "0.1")]
    unreachable_ratio: f64,

    /// Number of peers walked concurrently.
    #[arg(short, long, default_value = "32")]
    concurrency: usize,

    /// Width of the preimage table in bits.
    #[arg(short, long, default_value = "10")]
    prefix_bits: u32,

    /// Number of passes before stopping, runs until ctrl-c if absent.
    #[arg(long)]
    passes: Option<u64>,

    /// Log level.
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Build a network where every node knows a few random others per bucket.
fn simulated_network(args: &Args) -> (Arc<MemoryTransport>, Vec<AddrInfo>) {
    let mut rng = rand::thread_rng();
    let infos: Vec<AddrInfo> = (0..args.nodes)
        .map(|i| {
            let addr: Multiaddr = format!("/ip4/100.64.{}.{}/tcp/4001", i / 256, i % 256)
                .parse()
                .unwrap_or_else(|_| Multiaddr::empty());
            AddrInfo::new(PeerId::random(), vec![addr])
        })
        .collect();

    let transport = Arc::new(MemoryTransport::new());
    for info in &infos {
        let mut node = SimulatedNode::new()
            .with_agent("simulated/0.1.0")
            .with_protocol("/ipfs/kad/1.0.0");
        if rng.gen_bool(args.telemetry_ratio.clamp(0.0, 1.0)) {
            node = node.with_protocol(dht_peers_crawler::DEFAULT_TELEMETRY_PROTOCOL);
        }
        if rng.gen_bool(args.unreachable_ratio.clamp(0.0, 1.0)) {
            node = node.unreachable();
        }
        for cpl in 0..4 {
            let entries = (0..3)
                .map(|_| infos[rng.gen_range(0..infos.len())].clone())
                .collect();
            node = node.with_bucket(cpl, entries);
        }
        transport.add_node(info.id, node);
    }

    let seeds = infos.iter().take(3).cloned().collect();
    (transport, seeds)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    // Configure fern logger
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] {} - {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log_level)
        .chain(std::io::stderr())
        .apply()?;

    if args.nodes == 0 {
        return Err("At least one node is required".into());
    }

    log::info!("CRAWLING A SIMULATED DHT OF {} NODES", args.nodes);
    let (transport, seeds) = simulated_network(&args);

    let walker = WalkerBuilder::new(transport)
        .with_seeds(seeds)
        .with_concurrency(args.concurrency)
        .with_prefix_bits(args.prefix_bits)
        .with_dispatch_interval(Duration::from_millis(1))
        .with_address_filter(dht_peers_crawler::AddressFilter::AllowAll);
    let crawler = Arc::new(
        CrawlerBuilder::new(walker)
            .with_pass_delay(Duration::from_secs(1))
            .build()?,
    );

    let (trigger, signal) = shutdown_channel();
    let mut subscription = crawler.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(id) = subscription.recv().await {
            log::info!("Telemetry peer: {id}");
        }
    });

    let runner = {
        let crawler = crawler.clone();
        tokio::spawn(async move { crawler.run(&signal).await })
    };

    let passes = args.passes;
    let watched = crawler.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = async {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if passes.is_some_and(|passes| watched.metrics().completed >= passes) {
                    break;
                }
            }
        } => {}
    }
    trigger.trigger();

    runner.await??;
    printer.await?;

    let metrics = crawler.metrics();
    log::info!(
        "Completed {} passes, last pass: {} peers, {} telemetry peers, {} errors",
        metrics.completed,
        metrics.last.peers,
        metrics.last.telemetry_peers,
        metrics.last.errors
    );

    Ok(())
}
