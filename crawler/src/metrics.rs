//! Per-pass crawl counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts for a single pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassCounts {
    /// Distinct peers walked successfully.
    pub peers: u64,
    /// Distinct peers walked successfully that support telemetry.
    pub telemetry_peers: u64,
    /// Peers that could not be walked.
    pub errors: u64,
}

/// A point-in-time copy of the crawler's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// The pass in progress, or the next one.
    pub current: PassCounts,
    /// The most recently completed pass.
    pub last: PassCounts,
    /// Number of completed passes.
    pub completed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    peers: AtomicU64,
    telemetry_peers: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn load(&self) -> PassCounts {
        PassCounts {
            peers: self.peers.load(Ordering::Relaxed),
            telemetry_peers: self.telemetry_peers.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn take(&self) -> PassCounts {
        PassCounts {
            peers: self.peers.swap(0, Ordering::Relaxed),
            telemetry_peers: self.telemetry_peers.swap(0, Ordering::Relaxed),
            errors: self.errors.swap(0, Ordering::Relaxed),
        }
    }

    fn store(&self, counts: PassCounts) {
        self.peers.store(counts.peers, Ordering::Relaxed);
        self.telemetry_peers
            .store(counts.telemetry_peers, Ordering::Relaxed);
        self.errors.store(counts.errors, Ordering::Relaxed);
    }
}

/// Current and last pass counters, readable without the crawl state lock.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    current: Counters,
    last: Counters,
    completed: AtomicU64,
}

impl Metrics {
    pub fn record_peer(&self) {
        self.current.peers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_telemetry_peer(&self) {
        self.current.telemetry_peers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.current.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the current pass, returning its counts.
    pub fn complete_pass(&self) -> PassCounts {
        let counts = self.current.take();
        self.last.store(counts);
        self.completed.fetch_add(1, Ordering::Relaxed);
        counts
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            current: self.current.load(),
            last: self.last.load(),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}
