//! Checksum utilities for Haybale
//!
//! Every payload carries a SHA256 digest computed at upload and verified on
//! every read from disk.

use sha2::{Digest, Sha256};

/// Compute the SHA256 digest of a payload
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Compute the SHA256 digest as a lowercase hex string
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Verify a payload against an expected digest
#[must_use]
pub fn verify(data: &[u8], expected: &[u8; 32]) -> bool {
    &sha256(data) == expected
}

/// Streaming SHA256 calculator for large uploads
pub struct ChecksumCalculator {
    hasher: Sha256,
}

impl ChecksumCalculator {
    /// Create a new calculator
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Update with more data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize and return the digest
    #[must_use]
    pub fn finalize(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}
