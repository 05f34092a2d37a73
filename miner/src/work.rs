//! Work objects and the shared work board.
//!
//! A `Work` is immutable once published. The board replaces the current
//! work wholesale and bumps a generation counter; search loops poll the
//! counter between hash attempts and only take the read lock when it
//! moved, so publication never stalls a device mid-iteration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use num_bigint::BigUint;
use serde::Deserialize;

use crate::miner::Algorithm;

type Blake2b256 = Blake2b<U32>;

/// Header layout. The whole header is hashed; the nonce and the pool
/// extranonce live in fixed slots so a device can rewrite them without
/// touching the rest of the template.
pub const HEADER_LEN: usize = 88;
pub const VERSION_RANGE: std::ops::Range<usize> = 0..4;
pub const PARENT_ROOT_RANGE: std::ops::Range<usize> = 4..36;
pub const TX_ROOT_RANGE: std::ops::Range<usize> = 36..68;
pub const BITS_RANGE: std::ops::Range<usize> = 68..72;
pub const TIMESTAMP_RANGE: std::ops::Range<usize> = 72..76;
pub const EXTRANONCE1_RANGE: std::ops::Range<usize> = 76..80;
pub const EXTRANONCE2_RANGE: std::ops::Range<usize> = 80..84;
pub const NONCE_RANGE: std::ops::Range<usize> = 84..88;

/// Pool-assigned fields carried by pool-mode work.
#[derive(Debug, Clone)]
pub struct PoolWork {
    /// Session extranonce from `mining.subscribe`, already decoded.
    pub extranonce1: Vec<u8>,
    /// Bytes the worker may use for its own extranonce2.
    pub extranonce2_size: usize,
}

/// One mempool transaction from a solo block template.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTx {
    pub hash: String,
    pub data: String,
}

/// Solo-mode payload: everything needed to recompute the coinbase and
/// the transaction root locally, plus the raw pieces that go onto the
/// wire when a block is found.
#[derive(Debug, Clone)]
pub struct SoloWork {
    pub miner_address: String,
    pub coinbase_tag: String,
    pub parents: Vec<String>,
    pub transactions: Vec<TemplateTx>,
}

impl SoloWork {
    /// Number of real transactions, coinbase excluded.
    pub fn tx_count(&self) -> u64 {
        self.transactions.len() as u64
    }

    /// Recompute the transaction root for this device/instance pair.
    ///
    /// The coinbase is salted with the device id and the work instance so
    /// every device (and every nonce-space rollover) searches a disjoint
    /// header space.
    pub fn tx_root(&self, device_id: usize, instance: u32) -> Result<[u8; 32]> {
        let mut cb = Blake2b256::new();
        cb.update(self.miner_address.as_bytes());
        cb.update(self.coinbase_tag.as_bytes());
        cb.update((device_id as u32).to_le_bytes());
        cb.update(instance.to_le_bytes());
        let coinbase_hash: [u8; 32] = cb.finalize().into();

        let mut hashes = Vec::with_capacity(self.transactions.len() + 1);
        hashes.push(coinbase_hash);
        for tx in &self.transactions {
            let bytes = hex::decode(&tx.hash)
                .map_err(|e| anyhow!("bad transaction hash {}: {}", tx.hash, e))?;
            if bytes.len() != 32 {
                return Err(anyhow!("transaction hash {} is not 32 bytes", tx.hash));
            }
            let mut h = [0u8; 32];
            h.copy_from_slice(&bytes);
            hashes.push(h);
        }
        Ok(merkle_root(hashes))
    }
}

/// The active unit of search. Published by the work listener, consumed
/// read-only by every device search task.
#[derive(Debug, Clone)]
pub struct Work {
    pub generation: u64,
    pub algorithm: Algorithm,
    pub job_id: String,
    pub template: Vec<u8>,
    pub target: BigUint,
    pub height: u64,
    pub pool: Option<PoolWork>,
    pub solo: Option<SoloWork>,
}

impl Work {
    /// A work without job data and without a height has nothing to
    /// search against; devices wait instead of spinning on it.
    pub fn is_minable(&self) -> bool {
        if self.template.len() != HEADER_LEN {
            return false;
        }
        match (&self.pool, self.height) {
            (Some(_), _) => !self.job_id.is_empty(),
            (None, h) => h > 0,
        }
    }
}

/// Versioned publish-by-replacement holder for the current work.
///
/// Readers trust the generation stamped inside the snapshot they cloned,
/// never a separately-loaded flag, so the "newer work exists" check can
/// not disagree with the work actually read.
pub struct WorkBoard {
    generation: AtomicU64,
    current: RwLock<Option<Arc<Work>>>,
}

impl WorkBoard {
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            current: RwLock::new(None),
        }
    }

    /// Publish a new work, stamping the next generation. Single writer:
    /// only the work listener calls this.
    pub fn publish(&self, mut work: Work) -> u64 {
        let gen = self.generation.load(Ordering::Relaxed) + 1;
        work.generation = gen;
        *self.current.write().expect("work board poisoned") = Some(Arc::new(work));
        self.generation.store(gen, Ordering::Release);
        gen
    }

    /// Cheap per-iteration poll for search loops.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Option<Arc<Work>> {
        self.current.read().expect("work board poisoned").clone()
    }
}

impl Default for WorkBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// Maximum target (difficulty 1): 0x00000000FFFF << 208.
pub fn diff_one() -> BigUint {
    let mut bytes = [0u8; 32];
    bytes[4] = 0xff;
    bytes[5] = 0xff;
    BigUint::from_bytes_be(&bytes)
}

/// Convert a pool difficulty into a 256-bit target.
///
/// Fractional difficulties are honoured via 2^16 fixed-point scaling.
pub fn diff_to_target(difficulty: f64) -> BigUint {
    if difficulty <= 0.0 {
        return diff_one();
    }
    let scaled = (difficulty * 65536.0).round() as u128;
    if scaled == 0 {
        return diff_one();
    }
    (diff_one() << 16u32) / BigUint::from(scaled)
}

/// Parse a big-endian hex target, `0x` prefix optional.
pub fn parse_target_hex(target_hex: &str) -> Result<BigUint> {
    let t = target_hex.trim_start_matches("0x").trim();
    if t.is_empty() {
        return Err(anyhow!("empty target"));
    }
    let bytes = hex::decode(t).map_err(|e| anyhow!("bad target hex: {}", e))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

/// Success criterion: the digest, read as a big-endian integer, does not
/// exceed the target.
pub fn meets_target(digest: &[u8; 32], target: &BigUint) -> bool {
    BigUint::from_bytes_be(digest) <= *target
}

/// Double-Blake2b pairwise merkle root; an odd layer duplicates its last
/// entry, an empty set folds to zero.
pub fn merkle_root(mut hashes: Vec<[u8; 32]>) -> [u8; 32] {
    if hashes.is_empty() {
        return [0u8; 32];
    }
    while hashes.len() > 1 {
        if hashes.len() % 2 != 0 {
            let last = hashes[hashes.len() - 1];
            hashes.push(last);
        }
        let mut next = Vec::with_capacity(hashes.len() / 2);
        for pair in hashes.chunks(2) {
            let mut h = Blake2b256::new();
            h.update(pair[0]);
            h.update(pair[1]);
            let once: [u8; 32] = h.finalize().into();
            let again: [u8; 32] = Blake2b256::digest(once).into();
            next.push(again);
        }
        hashes = next;
    }
    hashes[0]
}

/// Bitcoin-style compact-size varint, hex encoded (little-endian payload).
pub fn varint_hex(n: u64) -> String {
    if n < 0xfd {
        format!("{:02x}", n)
    } else if n <= 0xffff {
        format!("fd{}", hex::encode((n as u16).to_le_bytes()))
    } else if n <= 0xffff_ffff {
        format!("fe{}", hex::encode((n as u32).to_le_bytes()))
    } else {
        format!("ff{}", hex::encode(n.to_le_bytes()))
    }
}
