// Hash function implementation for watchdog consensus
//
// BLAKE3 backs operation and action identifiers and proposer selection.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const HASH_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("Invalid hash size")]
    InvalidSize,
}

/// Hash output (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, HashError> {
        if slice.len() != HASH_SIZE {
            return Err(HashError::InvalidSize);
        }
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// All-zero hash, never produced for a real identifier
    pub fn zero() -> Self {
        Self([0u8; HASH_SIZE])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    /// Reduce the digest to an index in `0..modulus`.
    ///
    /// Uses the leading 16 bytes as a big-endian integer so the modulo bias
    /// is negligible for committee-sized moduli.
    pub fn reduce(&self, modulus: usize) -> usize {
        debug_assert!(modulus > 0);
        let mut head = [0u8; 16];
        head.copy_from_slice(&self.0[..16]);
        (u128::from_be_bytes(head) % modulus as u128) as usize
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Hash arbitrary data
pub fn hash_data(data: &[u8]) -> Hash {
    Hash::new(*blake3::hash(data).as_bytes())
}

/// Hash a sequence of fields with a domain tag.
///
/// Every field is length-prefixed, so `["ab", "c"]` and `["a", "bc"]`
/// never collide.
pub fn hash_fields(domain: &[u8], fields: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(domain.len() as u64).to_le_bytes());
    hasher.update(domain);
    for field in fields {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field);
    }
    Hash::new(*hasher.finalize().as_bytes())
}
