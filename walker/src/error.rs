//! Error types for walking the DHT.

use std::error::Error;
use std::fmt;
use std::io;

/// Errors reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug)]
pub enum TransportError {
    /// An I/O error occurred during network operations.
    Io(io::Error),
    /// The peer could not be dialed on any known address.
    Unreachable,
    /// An RPC was issued to a peer without an open connection.
    NotConnected,
    /// The remote answered with something the DHT protocol does not allow.
    Protocol(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(err) => write!(f, "Transport I/O error: {err}"),
            TransportError::Unreachable => write!(f, "Peer unreachable on all known addresses"),
            TransportError::NotConnected => write!(f, "Peer is not connected"),
            TransportError::Protocol(msg) => write!(f, "DHT protocol violation: {msg}"),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportError::Io(err) => Some(err),
            TransportError::Unreachable => None,
            TransportError::NotConnected => None,
            TransportError::Protocol(_) => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err)
    }
}

/// Why walking a single peer failed.
///
/// A failure is scoped to one peer and never aborts the pass it happened in.
#[derive(Debug)]
pub enum PeerFailure {
    /// The transport refused or failed the dial.
    Connect(TransportError),
    /// The dial did not complete within the connect timeout.
    ConnectTimeout,
    /// A closest-peers request failed.
    Request(TransportError),
    /// The closest-peers requests did not complete within the request timeout.
    RequestTimeout,
    /// The walk was cancelled while this peer was in flight.
    Cancelled,
    /// The worker walking this peer panicked.
    WorkerPanicked,
}

impl fmt::Display for PeerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerFailure::Connect(err) => write!(f, "Failed to connect: {err}"),
            PeerFailure::ConnectTimeout => write!(f, "Timed out connecting"),
            PeerFailure::Request(err) => write!(f, "Closest peers request failed: {err}"),
            PeerFailure::RequestTimeout => write!(f, "Timed out requesting closest peers"),
            PeerFailure::Cancelled => write!(f, "Walk cancelled"),
            PeerFailure::WorkerPanicked => write!(f, "Worker panicked"),
        }
    }
}

impl Error for PeerFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PeerFailure::Connect(err) => Some(err),
            PeerFailure::Request(err) => Some(err),
            PeerFailure::ConnectTimeout => None,
            PeerFailure::RequestTimeout => None,
            PeerFailure::Cancelled => None,
            PeerFailure::WorkerPanicked => None,
        }
    }
}

/// Errors that end a whole walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkError {
    /// The shutdown signal fired before the walk was exhausted.
    Cancelled,
    /// Every worker task stopped while work was still outstanding.
    WorkersExited,
}

impl fmt::Display for WalkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalkError::Cancelled => write!(f, "Walk cancelled"),
            WalkError::WorkersExited => write!(f, "All walk workers exited with work outstanding"),
        }
    }
}

impl Error for WalkError {}

/// Errors parsing a peer's routing record from a multiaddr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrInfoError {
    /// The text is not a multiaddr.
    InvalidMultiaddr(String),
    /// The multiaddr has no trailing `/p2p/<peer id>` component.
    MissingPeerId(String),
}

impl fmt::Display for AddrInfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrInfoError::InvalidMultiaddr(addr) => write!(f, "Invalid multiaddr: {addr}"),
            AddrInfoError::MissingPeerId(addr) => {
                write!(f, "Multiaddr has no /p2p component: {addr}")
            }
        }
    }
}

impl Error for AddrInfoError {}
