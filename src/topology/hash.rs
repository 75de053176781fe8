//! Stable hashing shared by every node.
//!
//! `std`'s `DefaultHasher` is randomly keyed per process, so two nodes would
//! disagree on ownership. FNV-1a is fixed and cheap; the finalizer spreads the
//! low bits before the segment modulo.

use std::hash::{Hash, Hasher};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

// == Stable Hasher ==
/// 64-bit FNV-1a hasher with a fixed seed.
#[derive(Debug, Clone)]
pub struct StableHasher {
    state: u64,
}

impl Default for StableHasher {
    fn default() -> Self {
        Self { state: FNV_OFFSET }
    }
}

impl Hasher for StableHasher {
    fn finish(&self) -> u64 {
        mix64(self.state)
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.state ^= *byte as u64;
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }
}

/// Hashes any `Hash` value with the stable hasher.
pub fn stable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = StableHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

/// splitmix64 finalizer.
pub(crate) fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_hash_is_repeatable() {
        assert_eq!(stable_hash("book_100"), stable_hash("book_100"));
        assert_eq!(stable_hash(&42u64), stable_hash(&42u64));
    }

    #[test]
    fn test_stable_hash_differs_for_different_keys() {
        assert_ne!(stable_hash("a"), stable_hash("b"));
    }

    #[test]
    fn test_fnv_known_vector() {
        // FNV-1a of the empty input is the offset basis
        let hasher = StableHasher::default();
        assert_eq!(hasher.finish(), mix64(FNV_OFFSET));
    }
}
