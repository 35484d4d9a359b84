//! Hashes used to score placement candidates.
//!
//! Uses BLAKE3 for all hashing operations. Scores must be identical on every
//! platform, so nothing here may depend on `std::hash` or process-local seeds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A BLAKE3 hash (256 bits / 32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// The number of bytes in a hash
    pub const LEN: usize = 32;

    /// Compute BLAKE3 hash of data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Hash two byte strings with a length prefix on the first,
    /// so `("ab", "c")` and `("a", "bc")` never collide.
    #[must_use]
    pub fn of_pair(left: &[u8], right: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(left.len() as u64).to_le_bytes());
        hasher.update(left);
        hasher.update(right);
        Self(*hasher.finalize().as_bytes())
    }

    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_compute() {
        let h1 = Hash::compute(b"hello");
        let h2 = Hash::compute(b"hello");
        assert_eq!(h1, h2);
        assert_ne!(h1, Hash::compute(b"world"));
    }

    #[test]
    fn test_hash_to_hex() {
        let h = Hash::compute(b"test");
        assert_eq!(h.to_hex().len(), 64);
        assert_eq!(format!("{}", h), h.to_hex());
    }

    #[test]
    fn test_of_pair_is_boundary_sensitive() {
        assert_ne!(Hash::of_pair(b"ab", b"c"), Hash::of_pair(b"a", b"bc"));
        assert_eq!(Hash::of_pair(b"a", b"bc"), Hash::of_pair(b"a", b"bc"));
    }

    proptest::proptest! {
        #[test]
        fn prop_of_pair_deterministic(left: Vec<u8>, right: Vec<u8>) {
            proptest::prop_assert_eq!(Hash::of_pair(&left, &right), Hash::of_pair(&left, &right));
        }
    }
}
