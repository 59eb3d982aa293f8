//! Core types shared across the pool
//!
//! Identity newtypes, miner credentials, block lifecycle states and the
//! hash rate wrapper used by stats reporting.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of one connected session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned miner identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MinerId(pub i64);

impl fmt::Display for MinerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned worker identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub i64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payout address as presented by the miner
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MinerAddress(pub String);

impl MinerAddress {
    /// Get the address as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MinerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Credentials parsed from a `mining.authorize` username
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub address: MinerAddress,
    pub worker: String,
}

impl Credentials {
    /// Worker name used when the username carries no `.worker` suffix
    pub const DEFAULT_WORKER: &'static str = "default";

    /// Split `address.worker`; the worker part is optional
    pub fn from_username(username: &str) -> Result<Self> {
        let username = username.trim();
        let (address, worker) = match username.split_once('.') {
            Some((address, worker)) => (address, worker),
            None => (username, Self::DEFAULT_WORKER),
        };

        if address.is_empty() {
            return Err(Error::protocol("empty miner address"));
        }
        if !address.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::protocol(format!(
                "miner address contains invalid characters: {}",
                address
            )));
        }

        let worker = if worker.is_empty() {
            Self::DEFAULT_WORKER
        } else {
            worker
        };

        Ok(Self {
            address: MinerAddress(address.to_string()),
            worker: worker.to_string(),
        })
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.address, self.worker)
    }
}

/// Lifecycle of a submitted block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockStatus {
    Pending,
    /// The node no longer knows the hash but maturity height is not reached
    PendingOrphaned,
    Confirmed,
    Orphaned,
}

impl BlockStatus {
    /// Confirmed and orphaned blocks never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, BlockStatus::Confirmed | BlockStatus::Orphaned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Pending => "PENDING",
            BlockStatus::PendingOrphaned => "PENDING_ORPHANED",
            BlockStatus::Confirmed => "CONFIRMED",
            BlockStatus::Orphaned => "ORPHANED",
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hash rate in hashes per second
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct HashRate(pub f64);

impl HashRate {
    /// Create new hash rate
    pub fn new(rate: f64) -> Self {
        Self(rate)
    }

    /// Get the rate value
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Estimate from credited effort over a window
    pub fn from_effort(effort: f64, hashes_per_difficulty: f64, seconds: f64) -> Self {
        if seconds <= 0.0 {
            return Self(0.0);
        }
        Self(effort * hashes_per_difficulty / seconds)
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::utils::format_hash_rate(self.0))
    }
}
