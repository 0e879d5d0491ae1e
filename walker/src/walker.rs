//! Public walking API.
//!
//! [`Walker`] runs whole walks over a transport, [`dump`] reads the routing
//! table of a single peer.

use crate::builder::{WalkerBuilder, WalkerBuilderError};
use crate::error::{PeerFailure, WalkError};
use crate::observer::Observer;
use crate::peer::AddrInfo;
use crate::preimage::PreimageTable;
use crate::session::WalkSession;
use crate::shutdown::ShutdownSignal;
use crate::transport::Transport;
use log::info;
use std::fmt;
use std::sync::Arc;

/// Walks the DHT by dumping the routing table of every reachable peer.
///
/// A walker is reusable, every call to [`Walker::walk`] starts a fresh pass
/// from the configured seeds.
pub struct Walker<T> {
    session: WalkSession<T>,
    seeds: Vec<AddrInfo>,
    observer: Arc<dyn Observer>,
}

impl<T: Transport> Walker<T> {
    pub(crate) fn new(session: WalkSession<T>, seeds: Vec<AddrInfo>, observer: Arc<dyn Observer>) -> Self {
        Walker {
            session,
            seeds,
            observer,
        }
    }

    /// Walk every peer reachable from the seeds exactly once.
    ///
    /// Failures of single peers are reported to the observer and never end
    /// the walk early.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Nothing is left to walk.
    /// * `Err(WalkError::Cancelled)` - The signal fired, pending peers were abandoned.
    /// * `Err(WalkError::WorkersExited)` - The worker pool ended with work remaining.
    pub async fn walk(&self, shutdown: &ShutdownSignal) -> Result<(), WalkError> {
        info!(
            "Starting walk from {} seeds with {} workers",
            self.seeds.len(),
            self.session.config().concurrency
        );
        self.session
            .coordinate(&self.seeds, self.observer.as_ref(), shutdown)
            .await
    }

    /// Dump the routing table of a single peer.
    ///
    /// The observer is not called.
    ///
    /// # Returns
    ///
    /// Every routing table entry the peer returned, bucket by bucket.
    pub async fn dump(
        &self,
        peer: AddrInfo,
        shutdown: &ShutdownSignal,
    ) -> Result<Vec<AddrInfo>, PeerFailure> {
        let transport = self.session.transport();
        transport.add_addresses(&peer.id, &peer.addrs);

        let walked = self
            .session
            .process(peer.id, shutdown)
            .await
            .map_err(|err| err.cause)?;
        Ok(walked.buckets.into_iter().flatten().collect())
    }

    pub fn seeds(&self) -> &[AddrInfo] {
        &self.seeds
    }

    pub fn preimage_table(&self) -> &Arc<PreimageTable> {
        self.session.table()
    }

    pub fn transport(&self) -> &Arc<T> {
        self.session.transport()
    }

    /// Number of worker tasks per walk.
    pub fn concurrency(&self) -> usize {
        self.session.config().concurrency
    }
}

impl<T> fmt::Debug for Walker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Walker")
            .field("seeds", &self.seeds)
            .finish_non_exhaustive()
    }
}

/// Errors from the one-shot [`dump`].
#[derive(Debug)]
pub enum DumpError {
    /// The walker could not be built.
    Build(WalkerBuilderError),
    /// The peer could not be walked.
    Peer(PeerFailure),
}

impl fmt::Display for DumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpError::Build(err) => write!(f, "Failed to build walker: {err}"),
            DumpError::Peer(err) => write!(f, "Failed to dump peer: {err}"),
        }
    }
}

impl std::error::Error for DumpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DumpError::Build(err) => Some(err),
            DumpError::Peer(err) => Some(err),
        }
    }
}

impl From<WalkerBuilderError> for DumpError {
    fn from(err: WalkerBuilderError) -> Self {
        DumpError::Build(err)
    }
}

impl From<PeerFailure> for DumpError {
    fn from(err: PeerFailure) -> Self {
        DumpError::Peer(err)
    }
}

/// Dump the routing table of one peer with a default single-worker walker.
///
/// Generates a preimage table of the default width first, which takes a
/// while. Build a [`Walker`] sharing a table to dump many peers.
pub async fn dump<T: Transport>(
    transport: Arc<T>,
    peer: AddrInfo,
    shutdown: &ShutdownSignal,
) -> Result<Vec<AddrInfo>, DumpError> {
    let walker = WalkerBuilder::new(transport)
        .with_concurrency(1)
        .with_seeds(vec![peer.clone()])
        .build()?;
    Ok(walker.dump(peer, shutdown).await?)
}
