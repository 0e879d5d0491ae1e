use crate::crawler::CrawlState;
use dht_peers_walker::PeerId;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Weak;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// A stream of telemetry peers discovered by a [`Crawler`](crate::Crawler).
///
/// Yields the telemetry peers already known in the current pass first, then
/// live discoveries. Live discoveries are dropped while the queue is full.
/// Dropping the subscription unregisters it.
pub struct Subscription {
    backlog: VecDeque<PeerId>,
    rx: mpsc::Receiver<PeerId>,
    state: Weak<CrawlState>,
    id: u64,
}

impl Subscription {
    pub(crate) fn new(
        backlog: VecDeque<PeerId>,
        rx: mpsc::Receiver<PeerId>,
        state: Weak<CrawlState>,
        id: u64,
    ) -> Self {
        Subscription {
            backlog,
            rx,
            state,
            id,
        }
    }

    /// Receive the next telemetry peer.
    ///
    /// # Returns
    ///
    /// * `Some(PeerId)` - The next telemetry peer.
    /// * `None` - The crawler stopped running or was dropped.
    pub async fn recv(&mut self) -> Option<PeerId> {
        if let Some(id) = self.backlog.pop_front() {
            return Some(id);
        }
        self.rx.recv().await
    }

    /// Receive the next telemetry peer if one is ready.
    pub fn try_recv(&mut self) -> Result<PeerId, TryRecvError> {
        if let Some(id) = self.backlog.pop_front() {
            return Ok(id);
        }
        self.rx.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.unsubscribe(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}
