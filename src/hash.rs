//! 256-bit hashes and the double-SHA256 used throughout the wire format.

use sha2::{Digest, Sha256};
use std::fmt;

/// A 256-bit hash (block hash, transaction hash, message checksum input).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Build from a 32-byte slice. Panics on any other length; callers parse
    /// fixed-size fields and are expected to have checked bounds already.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut h = [0u8; 32];
        h.copy_from_slice(bytes);
        Hash256(h)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse the byte-reversed hex form produced by `Display`.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = hex::decode(s).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        bytes.reverse();
        Some(Hash256::from_slice(&bytes))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Conventional presentation: most significant byte first.
        let mut rev = self.0;
        rev.reverse();
        f.write_str(&hex::encode(rev))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self)
    }
}

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    Hash256(second.into())
}

/// The 4-byte truncated double hash carried in every message header.
pub fn checksum4(payload: &[u8]) -> [u8; 4] {
    let h = sha256d(payload);
    [h.0[0], h.0[1], h.0[2], h.0[3]]
}
