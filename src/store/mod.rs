//! Durable store collaborators
//!
//! Two seams: [`MetricsStore`] for append-only time series and
//! [`PoolStore`] for identities, blocks, balances and round closure.
//! [`memory::MemoryStore`] implements both in process.

pub mod memory;

pub use memory::MemoryStore;

use crate::crypto::Hash256;
use crate::round::{RewardScheme, RoundSnapshot};
use crate::types::{BlockStatus, MinerAddress, MinerId, WorkerId};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A found block as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub height: u64,
    pub hash: Hash256,
    pub reward: u64,
    /// Network difficulty of the job that found it
    pub difficulty: f64,
    /// Round effort at the time of the find
    pub effort: f64,
    pub status: BlockStatus,
    pub finder: MinerId,
    pub worker: WorkerId,
    pub found_at: u64,
    /// Sequence number of the round this block closed
    pub block_number: u64,
}

/// Reward owed to a miner from one block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutEntry {
    pub miner: MinerId,
    pub block_hash: Hash256,
    pub amount: u64,
    pub share: f64,
}

/// Everything a round close writes, applied all-or-nothing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundClosure {
    pub scheme: RewardScheme,
    pub block: BlockRecord,
    pub payouts: Vec<PayoutEntry>,
    /// Progress recorded for the round that opens
    pub next_round: RoundSnapshot,
}

/// Per-miner balances
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub immature: u64,
    pub mature: u64,
}

/// Aggregation applied when down-sampling a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Avg,
    Sum,
    Max,
}

/// Optional down-sampling rule for a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownsampleRule {
    pub bucket: Duration,
    pub aggregation: Aggregation,
}

/// Retention settings applied to every metric series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRetention {
    pub retention: Duration,
    pub downsample: Option<DownsampleRule>,
}

/// One time-series sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Series prefix, e.g. `hashrate` or `shares`
    pub prefix: String,
    pub labels: BTreeMap<String, String>,
    pub timestamp: u64,
    pub value: f64,
}

impl MetricPoint {
    pub fn new(prefix: impl Into<String>, timestamp: u64, value: f64) -> Self {
        Self {
            prefix: prefix.into(),
            labels: BTreeMap::new(),
            timestamp,
            value,
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.labels.insert(key.into(), value.to_string());
        self
    }

    /// Series key: prefix plus sorted labels
    pub fn series_key(&self) -> String {
        let mut key = self.prefix.clone();
        for (name, value) in &self.labels {
            key.push(':');
            key.push_str(name);
            key.push('=');
            key.push_str(value);
        }
        key
    }
}

/// Append-only time-series store
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn append(&self, points: &[MetricPoint]) -> Result<()>;
}

/// Relational pool state
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Return the id for `address`, creating it if absent
    async fn add_miner(&self, address: &MinerAddress) -> Result<MinerId>;

    /// Return the id for `name` under `miner`, creating it if absent
    async fn add_worker(&self, miner: MinerId, name: &str) -> Result<WorkerId>;

    /// Record the block, credit immature payouts and start the next round
    async fn commit_round(&self, closure: &RoundClosure) -> Result<()>;

    /// Blocks that are neither confirmed nor orphaned
    async fn immature_blocks(&self) -> Result<Vec<BlockRecord>>;

    /// Flag a non-terminal status change
    async fn update_block_status(&self, hash: &Hash256, status: BlockStatus) -> Result<()>;

    /// Mark confirmed and move the block's payouts from immature to mature
    async fn confirm_block(&self, hash: &Hash256) -> Result<()>;

    /// Mark orphaned and reverse the block's immature payouts
    async fn orphan_block(&self, hash: &Hash256) -> Result<()>;

    async fn balance(&self, miner: MinerId) -> Result<Balance>;

    /// Persist the open round's progress
    async fn save_round_progress(&self, scheme: RewardScheme, snapshot: &RoundSnapshot)
        -> Result<()>;

    /// Last persisted progress of the open round, if any
    async fn load_round_progress(&self, scheme: RewardScheme) -> Result<Option<RoundSnapshot>>;
}
