//! Hashing primitives
//!
//! The proof-of-work hash is injected as a [`HashFunction`]. SHA-256d is
//! provided here because the job builder needs it regardless of coin family
//! (transaction ids, merkle nodes, block hashes).

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 256-bit hash stored in internal (little-endian) byte order
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    /// All-zero hash
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Wrap raw bytes in internal order
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes in internal order
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a big-endian (RPC display order) hex string
    pub fn from_hex_be(s: &str) -> Result<Self> {
        let mut bytes = hex::decode(s)
            .map_err(|e| Error::encoding(format!("invalid hash hex {}: {}", s, e)))?;
        if bytes.len() != 32 {
            return Err(Error::encoding(format!(
                "hash must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        bytes.reverse();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// Render as big-endian hex, the order nodes and explorers display
    pub fn to_hex_be(&self) -> String {
        let mut bytes = self.0;
        bytes.reverse();
        hex::encode(bytes)
    }

    /// Render in internal order
    pub fn to_hex_le(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight bytes as an integer, used as a cheap fingerprint
    pub fn fingerprint(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(head)
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex_be())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex_be())
    }
}

impl Serialize for Hash256 {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex_be())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Hash256::from_hex_be(&s).map_err(serde::de::Error::custom)
    }
}

/// Proof-of-work hash capability
pub trait HashFunction: Send + Sync {
    /// Hash a fully patched header (plus solution, when the family has one)
    fn hash(&self, header: &[u8]) -> Hash256;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Double SHA-256
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256d;

impl HashFunction for Sha256d {
    fn hash(&self, header: &[u8]) -> Hash256 {
        sha256d(header)
    }

    fn name(&self) -> &'static str {
        "sha256d"
    }
}

/// Double SHA-256 of `data`
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    Hash256(second.into())
}

/// Hash the concatenation of two nodes, as merkle trees do
pub fn sha256d_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&left.0);
    buf[32..].copy_from_slice(&right.0);
    sha256d(&buf)
}
