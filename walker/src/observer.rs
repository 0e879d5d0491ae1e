//! Sinks for walk outcomes.

use crate::peer::{CrawlError, Peer};
use std::sync::{Arc, Mutex, PoisonError};

/// Receives the outcome of every peer walked.
///
/// Callbacks run on the walk's coordinating task, one at a time, so they
/// should return quickly.
pub trait Observer: Send + Sync {
    /// A peer was walked successfully.
    fn observe_peer(&self, peer: &Peer);
    /// A peer could not be walked.
    fn observe_error(&self, error: &CrawlError);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn observe_peer(&self, _peer: &Peer) {}
    fn observe_error(&self, _error: &CrawlError) {}
}

/// Calls a function for every successfully walked peer and ignores errors.
pub struct PeerObserverFn<F> {
    f: F,
}

impl<F> PeerObserverFn<F>
where
    F: Fn(&Peer) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        PeerObserverFn { f }
    }
}

impl<F> Observer for PeerObserverFn<F>
where
    F: Fn(&Peer) + Send + Sync,
{
    fn observe_peer(&self, peer: &Peer) {
        (self.f)(peer)
    }

    fn observe_error(&self, _error: &CrawlError) {}
}

/// Forwards every outcome to each of its observers, in order.
#[derive(Clone, Default)]
pub struct MultiObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl MultiObserver {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        MultiObserver { observers }
    }

    /// Add another observer to the end of the fan-out.
    pub fn push(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl Observer for MultiObserver {
    fn observe_peer(&self, peer: &Peer) {
        for observer in &self.observers {
            observer.observe_peer(peer);
        }
    }

    fn observe_error(&self, error: &CrawlError) {
        for observer in &self.observers {
            observer.observe_error(error);
        }
    }
}

/// Keeps a summary of every outcome.
///
/// Errors are not `Clone`, so only their identifiers and rendered causes are
/// kept.
#[derive(Debug, Default)]
pub struct CollectorObserver {
    peers: Mutex<Vec<Peer>>,
    errors: Mutex<Vec<(libp2p::PeerId, String)>>,
}

impl CollectorObserver {
    pub fn new() -> Self {
        CollectorObserver::default()
    }

    /// Peers observed so far.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Failed peers observed so far with the rendered failure.
    pub fn errors(&self) -> Vec<(libp2p::PeerId, String)> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Observer for CollectorObserver {
    fn observe_peer(&self, peer: &Peer) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(peer.clone());
    }

    fn observe_error(&self, error: &CrawlError) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((error.id, error.cause.to_string()));
    }
}
