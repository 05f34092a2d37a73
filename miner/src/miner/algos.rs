//! Built-in hash providers.
//!
//! Every provider is a pure function from header bytes to a 32-byte
//! digest; the search loop interprets the digest big-endian against the
//! work target. New algorithms plug in here and in the registry.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use sha3::Sha3_256;

type Blake2b256 = Blake2b<U32>;

/// Double Blake2b-256.
pub fn blake2bd(header: &[u8]) -> [u8; 32] {
    let once: [u8; 32] = Blake2b256::digest(header).into();
    Blake2b256::digest(once).into()
}

/// Double SHA3-256.
pub fn sha3d(header: &[u8]) -> [u8; 32] {
    let once: [u8; 32] = Sha3_256::digest(header).into();
    Sha3_256::digest(once).into()
}

/// Single BLAKE3.
pub fn blake3(header: &[u8]) -> [u8; 32] {
    *blake3::hash(header).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digests_are_deterministic_and_distinct() {
        let header = [0x5au8; 88];
        assert_eq!(blake2bd(&header), blake2bd(&header));
        assert_eq!(sha3d(&header), sha3d(&header));
        assert_eq!(blake3(&header), blake3(&header));

        assert_ne!(blake2bd(&header), sha3d(&header));
        assert_ne!(blake2bd(&header), blake3(&header));
    }

    #[test]
    fn test_double_hash_differs_from_single() {
        let header = [1u8; 88];
        let single: [u8; 32] = blake2::Blake2b::<blake2::digest::consts::U32>::digest(header).into();
        assert_ne!(blake2bd(&header), single);
    }

    #[test]
    fn test_nonce_changes_digest() {
        let mut a = [0u8; 88];
        let mut b = [0u8; 88];
        a[84..88].copy_from_slice(&1u32.to_le_bytes());
        b[84..88].copy_from_slice(&2u32.to_le_bytes());
        assert_ne!(blake2bd(&a), blake2bd(&b));
    }
}
