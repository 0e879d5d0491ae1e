//! Precomputed bucket targeting.
//!
//! Asking a peer for the closest peers to a key returns the contents of the
//! routing table bucket the key falls into. A [`PreimageTable`] holds, for every
//! possible `bits` wide key prefix, one peer identifier whose key has exactly that
//! prefix. Flipping one bit of a peer's own prefix and looking the result up
//! yields a key at a chosen common prefix length, which targets one bucket.
//!
//! Buckets deeper than the table width are never targeted.

use crate::key::KadKey;
use libp2p::PeerId;
use log::debug;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::thread;

/// Default table width, which targets the first 16 buckets of a peer.
pub const DEFAULT_PREFIX_BITS: u32 = 16;
/// Widest table that may be generated, 2^24 slots.
pub const MAX_PREFIX_BITS: u32 = 24;

/// Multihash code for sha2-256.
const SHA2_256_CODE: u8 = 0x12;
/// Size of the random payload hashed into a candidate identifier.
const PAYLOAD_BYTES: usize = 64;
/// Candidates buffered per generation worker.
const HANDOFF_DEPTH: usize = 64;

static DEFAULT_TABLE: OnceLock<Arc<PreimageTable>> = OnceLock::new();

/// Errors building a [`PreimageTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreimageError {
    /// Width outside `1..=MAX_PREFIX_BITS`.
    InvalidWidth(u32),
    /// A loaded table does not have `2^bits` slots.
    WrongLength { expected: usize, actual: usize },
    /// A loaded slot holds an identifier whose key has a different prefix.
    PrefixMismatch { slot: usize },
    /// Generation stopped before every slot was filled.
    Incomplete { missing: usize },
    /// A loaded slot does not hold a valid peer identifier.
    InvalidId { slot: usize },
    /// A stored table could not be read or written.
    Encoding(String),
}

impl fmt::Display for PreimageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreimageError::InvalidWidth(bits) => {
                write!(f, "Invalid preimage table width {bits}, must be 1..={MAX_PREFIX_BITS}")
            }
            PreimageError::WrongLength { expected, actual } => {
                write!(f, "Preimage table has {actual} slots, expected {expected}")
            }
            PreimageError::PrefixMismatch { slot } => {
                write!(f, "Preimage table slot {slot} holds an id with another prefix")
            }
            PreimageError::Incomplete { missing } => {
                write!(f, "Preimage table generation stopped with {missing} empty slots")
            }
            PreimageError::InvalidId { slot } => {
                write!(f, "Preimage table slot {slot} is not a peer id")
            }
            PreimageError::Encoding(err) => write!(f, "Preimage table encoding error: {err}"),
        }
    }
}

impl std::error::Error for PreimageError {}

/// On-disk shape of a table, identifiers in base58.
#[derive(Serialize, Deserialize)]
struct StoredTable {
    bits: u32,
    ids: Vec<String>,
}

/// Lookup from key prefix to a peer identifier with that prefix.
///
/// Serializes as `{"bits": .., "ids": [..]}` and is validated again when
/// deserialized.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "StoredTable", into = "StoredTable")]
pub struct PreimageTable {
    bits: u32,
    slots: Vec<PeerId>,
}

impl PreimageTable {
    /// Generate a table of [`DEFAULT_PREFIX_BITS`] width.
    ///
    /// This hashes on the order of a million candidates and takes a noticeable
    /// amount of time, so build a table once and share it.
    pub fn generate() -> Result<Self, PreimageError> {
        Self::generate_with_bits(DEFAULT_PREFIX_BITS)
    }

    /// The process wide table of [`DEFAULT_PREFIX_BITS`] width.
    ///
    /// Generated by the first caller, later callers share it.
    pub fn shared_default() -> Result<Arc<Self>, PreimageError> {
        if let Some(table) = DEFAULT_TABLE.get() {
            return Ok(table.clone());
        }
        let table = Arc::new(Self::generate()?);
        Ok(DEFAULT_TABLE.get_or_init(|| table).clone())
    }

    /// Generate a table with `2^bits` slots.
    ///
    /// Worker threads, one per available core, hash random payloads into
    /// candidate identifiers and hand them to the calling thread, which is the
    /// only writer of the table. Workers stop once every slot is filled.
    ///
    /// # Arguments
    ///
    /// * `bits` - Table width, `1..=MAX_PREFIX_BITS`.
    ///
    /// # Returns
    ///
    /// * `Ok(PreimageTable)` - A fully populated table.
    /// * `Err(PreimageError)` - If the width is out of range.
    pub fn generate_with_bits(bits: u32) -> Result<Self, PreimageError> {
        check_width(bits)?;

        let total = 1usize << bits;
        let workers = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let stop = AtomicBool::new(false);
        let (candidate_tx, candidate_rx) = mpsc::sync_channel::<(PeerId, usize)>(workers * HANDOFF_DEPTH);

        debug!("Generating {total} slot preimage table with {workers} workers");

        let slots = thread::scope(|scope| {
            for _ in 0..workers {
                let candidate_tx = candidate_tx.clone();
                let stop = &stop;
                scope.spawn(move || {
                    let mut rng = rand::thread_rng();
                    while !stop.load(Ordering::Relaxed) {
                        let Some(id) = random_candidate(&mut rng) else {
                            continue;
                        };
                        let prefix = KadKey::for_peer(&id).prefix(bits);
                        if candidate_tx.send((id, prefix)).is_err() {
                            // Collector finished.
                            break;
                        }
                    }
                });
            }
            // Only the workers hold senders now.
            drop(candidate_tx);

            let mut slots: Vec<Option<PeerId>> = vec![None; total];
            let mut missing = total;
            let progress_step = (total / 10).max(1);
            while missing > 0 {
                let Ok((id, prefix)) = candidate_rx.recv() else {
                    break;
                };
                if slots[prefix].is_none() {
                    slots[prefix] = Some(id);
                    missing -= 1;
                    if missing % progress_step == 0 {
                        debug!(
                            "Preimage table {:.0}% filled",
                            (total - missing) as f64 / total as f64 * 100.0
                        );
                    }
                }
            }

            stop.store(true, Ordering::Relaxed);
            drop(candidate_rx);
            slots
        });

        let missing = slots.iter().filter(|slot| slot.is_none()).count();
        let slots: Option<Vec<PeerId>> = slots.into_iter().collect();
        match slots {
            Some(slots) => Ok(PreimageTable { bits, slots }),
            None => Err(PreimageError::Incomplete { missing }),
        }
    }

    /// Load a precomputed table.
    ///
    /// # Arguments
    ///
    /// * `bits` - Table width.
    /// * `ids` - One identifier per prefix, indexed by prefix.
    ///
    /// # Returns
    ///
    /// * `Ok(PreimageTable)` - If every slot holds an identifier with its own prefix.
    /// * `Err(PreimageError)` - If the width, length, or any slot is wrong.
    pub fn from_ids(bits: u32, ids: Vec<PeerId>) -> Result<Self, PreimageError> {
        check_width(bits)?;
        let expected = 1usize << bits;
        if ids.len() != expected {
            return Err(PreimageError::WrongLength {
                expected,
                actual: ids.len(),
            });
        }
        if let Some(slot) = ids
            .iter()
            .enumerate()
            .position(|(slot, id)| KadKey::for_peer(id).prefix(bits) != slot)
        {
            return Err(PreimageError::PrefixMismatch { slot });
        }
        Ok(PreimageTable { bits, slots: ids })
    }

    /// Write the table as JSON.
    pub fn write_json<W: io::Write>(&self, writer: W) -> Result<(), PreimageError> {
        serde_json::to_writer(writer, self).map_err(|err| PreimageError::Encoding(err.to_string()))
    }

    /// Read a table written by [`PreimageTable::write_json`].
    ///
    /// The loaded table goes through the same checks as [`PreimageTable::from_ids`].
    pub fn read_json<R: io::Read>(reader: R) -> Result<Self, PreimageError> {
        let stored: StoredTable = serde_json::from_reader(reader)
            .map_err(|err| PreimageError::Encoding(err.to_string()))?;
        Self::try_from(stored)
    }

    /// Table width in bits.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Number of slots, always `2^bits`.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false, a table has at least two slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The identifier stored for a prefix.
    pub fn get(&self, prefix: usize) -> Option<&PeerId> {
        self.slots.get(prefix)
    }

    /// Bucket targets for a peer.
    ///
    /// Entry `i` has a key sharing exactly `i` leading bits with the peer's key,
    /// so asking the peer for the closest peers to it returns bucket `i` of the
    /// peer's routing table.
    ///
    /// # Returns
    ///
    /// Exactly `bits` identifiers, ordered by common prefix length.
    pub fn targets_for(&self, peer: &PeerId) -> Vec<PeerId> {
        let prefix = KadKey::for_peer(peer).prefix(self.bits);
        (0..self.bits)
            .map(|bit| {
                let mask = 1usize << (self.bits - bit - 1);
                self.slots[prefix ^ mask]
            })
            .collect()
    }
}

impl fmt::Debug for PreimageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreimageTable")
            .field("bits", &self.bits)
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl TryFrom<StoredTable> for PreimageTable {
    type Error = PreimageError;

    fn try_from(stored: StoredTable) -> Result<Self, Self::Error> {
        let ids = stored
            .ids
            .iter()
            .enumerate()
            .map(|(slot, id)| id.parse().map_err(|_| PreimageError::InvalidId { slot }))
            .collect::<Result<Vec<PeerId>, _>>()?;
        PreimageTable::from_ids(stored.bits, ids)
    }
}

impl From<PreimageTable> for StoredTable {
    fn from(table: PreimageTable) -> Self {
        StoredTable {
            bits: table.bits,
            ids: table.slots.iter().map(|id| id.to_base58()).collect(),
        }
    }
}

fn check_width(bits: u32) -> Result<(), PreimageError> {
    if bits == 0 || bits > MAX_PREFIX_BITS {
        return Err(PreimageError::InvalidWidth(bits));
    }
    Ok(())
}

/// A random sha2-256 multihash identifier, the same shape as RSA peer ids.
fn random_candidate<R: RngCore>(rng: &mut R) -> Option<PeerId> {
    let mut payload = [0u8; PAYLOAD_BYTES];
    rng.fill_bytes(&mut payload);
    let digest = Sha256::digest(payload);

    let mut multihash = Vec::with_capacity(2 + digest.len());
    multihash.push(SHA2_256_CODE);
    multihash.push(digest.len() as u8);
    multihash.extend_from_slice(&digest);
    PeerId::from_bytes(&multihash).ok()
}
