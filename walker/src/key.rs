//! Kademlia keyspace helpers.
//!
//! Peers are placed in the DHT by the SHA-256 digest of their identifier bytes,
//! so bucket membership is decided by the common prefix of two digests rather
//! than of the identifiers themselves.

use libp2p::PeerId;
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of bytes in a [`KadKey`].
pub const KEY_BYTES: usize = 32;
/// Number of bits in a [`KadKey`].
pub const KEY_BITS: u32 = (KEY_BYTES * 8) as u32;

/// Position of a peer in the Kademlia keyspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KadKey([u8; KEY_BYTES]);

impl KadKey {
    /// Derive the key for a peer identifier.
    pub fn for_peer(peer: &PeerId) -> Self {
        KadKey(Sha256::digest(peer.to_bytes()).into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    /// The leading `bits` bits of the key as an integer.
    ///
    /// `bits` is clamped to 32.
    pub fn prefix(&self, bits: u32) -> usize {
        let bits = bits.min(32);
        if bits == 0 {
            return 0;
        }
        let head = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        (head >> (32 - bits)) as usize
    }

    /// Number of leading bits shared with `other`.
    ///
    /// Identical keys share all [`KEY_BITS`] bits.
    pub fn common_prefix_len(&self, other: &KadKey) -> u32 {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let diff = a ^ b;
            if diff != 0 {
                return i as u32 * 8 + diff.leading_zeros();
            }
        }
        KEY_BITS
    }
}

impl fmt::Debug for KadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KadKey(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}
