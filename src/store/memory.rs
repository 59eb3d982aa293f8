//! In-process store
//!
//! All state sits behind one lock, so every operation, `commit_round`
//! included, is applied completely or not at all.

use super::{
    Aggregation, Balance, BlockRecord, MetricPoint, MetricsRetention, MetricsStore, PayoutEntry,
    PoolStore, RoundClosure,
};
use crate::crypto::Hash256;
use crate::round::{RewardScheme, RoundSnapshot};
use crate::types::{BlockStatus, MinerAddress, MinerId, WorkerId};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct Inner {
    miners: HashMap<MinerAddress, MinerId>,
    workers: HashMap<(MinerId, String), WorkerId>,
    next_miner: i64,
    next_worker: i64,
    blocks: Vec<BlockRecord>,
    payouts: HashMap<Hash256, Vec<PayoutEntry>>,
    balances: HashMap<MinerId, Balance>,
    rounds: HashMap<RewardScheme, RoundSnapshot>,
    series: BTreeMap<String, Vec<MetricPoint>>,
}

impl Inner {
    fn block_mut(&mut self, hash: &Hash256) -> Result<&mut BlockRecord> {
        self.blocks
            .iter_mut()
            .find(|b| b.hash == *hash)
            .ok_or_else(|| Error::store(format!("unknown block {}", hash)))
    }
}

/// In-memory implementation of both store traits
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    retention: Option<MetricsRetention>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MemoryStore {
    pub fn new(retention: Option<MetricsRetention>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retention,
        }
    }

    /// All blocks, oldest first
    pub fn blocks(&self) -> Vec<BlockRecord> {
        self.inner.lock().blocks.clone()
    }

    pub fn block(&self, hash: &Hash256) -> Option<BlockRecord> {
        self.inner.lock().blocks.iter().find(|b| b.hash == *hash).cloned()
    }

    pub fn payouts(&self, hash: &Hash256) -> Vec<PayoutEntry> {
        self.inner.lock().payouts.get(hash).cloned().unwrap_or_default()
    }

    pub fn round_progress(&self, scheme: RewardScheme) -> Option<RoundSnapshot> {
        self.inner.lock().rounds.get(&scheme).cloned()
    }

    /// Raw points of one series
    pub fn series(&self, key: &str) -> Vec<MetricPoint> {
        self.inner.lock().series.get(key).cloned().unwrap_or_default()
    }

    /// Series keys currently held
    pub fn series_keys(&self) -> Vec<String> {
        self.inner.lock().series.keys().cloned().collect()
    }

    /// A series down-sampled by the configured rule, as `(bucket_start, value)`
    pub fn downsampled(&self, key: &str) -> Vec<(u64, f64)> {
        let points = self.series(key);
        let Some(rule) = self.retention.and_then(|r| r.downsample) else {
            return points.iter().map(|p| (p.timestamp, p.value)).collect();
        };

        let width = rule.bucket.as_secs().max(1);
        let mut buckets: BTreeMap<u64, Vec<f64>> = BTreeMap::new();
        for point in points {
            buckets
                .entry(point.timestamp / width * width)
                .or_default()
                .push(point.value);
        }

        buckets
            .into_iter()
            .map(|(start, values)| {
                let value = match rule.aggregation {
                    Aggregation::Sum => values.iter().sum(),
                    Aggregation::Max => values.iter().copied().fold(f64::MIN, f64::max),
                    Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
                };
                (start, value)
            })
            .collect()
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn append(&self, points: &[MetricPoint]) -> Result<()> {
        let mut inner = self.inner.lock();
        for point in points {
            let series = inner.series.entry(point.series_key()).or_default();
            series.push(point.clone());
            if let Some(retention) = self.retention {
                let horizon = point.timestamp.saturating_sub(retention.retention.as_secs());
                series.retain(|p| p.timestamp >= horizon);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn add_miner(&self, address: &MinerAddress) -> Result<MinerId> {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.miners.get(address) {
            return Ok(*id);
        }
        inner.next_miner += 1;
        let id = MinerId(inner.next_miner);
        inner.miners.insert(address.clone(), id);
        Ok(id)
    }

    async fn add_worker(&self, miner: MinerId, name: &str) -> Result<WorkerId> {
        let mut inner = self.inner.lock();
        if !inner.miners.values().any(|id| *id == miner) {
            return Err(Error::store(format!("unknown miner {}", miner)));
        }
        let key = (miner, name.to_string());
        if let Some(id) = inner.workers.get(&key) {
            return Ok(*id);
        }
        inner.next_worker += 1;
        let id = WorkerId(inner.next_worker);
        inner.workers.insert(key, id);
        Ok(id)
    }

    async fn commit_round(&self, closure: &RoundClosure) -> Result<()> {
        let mut inner = self.inner.lock();

        // Validate everything before the first write
        if inner
            .blocks
            .iter()
            .any(|b| b.hash == closure.block.hash || b.height == closure.block.height)
        {
            return Err(Error::store(format!(
                "block {} at height {} already recorded",
                closure.block.hash, closure.block.height
            )));
        }
        let paid: u64 = closure.payouts.iter().map(|p| p.amount).sum();
        if paid > closure.block.reward {
            return Err(Error::store(format!(
                "payouts {} exceed block reward {}",
                paid, closure.block.reward
            )));
        }

        inner.blocks.push(closure.block.clone());
        for payout in &closure.payouts {
            inner.balances.entry(payout.miner).or_default().immature += payout.amount;
        }
        inner
            .payouts
            .insert(closure.block.hash, closure.payouts.clone());
        inner.rounds.insert(closure.scheme, closure.next_round.clone());
        Ok(())
    }

    async fn immature_blocks(&self) -> Result<Vec<BlockRecord>> {
        Ok(self
            .inner
            .lock()
            .blocks
            .iter()
            .filter(|b| !b.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn update_block_status(&self, hash: &Hash256, status: BlockStatus) -> Result<()> {
        if status.is_terminal() {
            return Err(Error::store(
                "terminal states are set by confirm_block or orphan_block",
            ));
        }
        let mut inner = self.inner.lock();
        let block = inner.block_mut(hash)?;
        if block.status.is_terminal() {
            return Err(Error::store(format!("block {} is already {}", hash, block.status)));
        }
        block.status = status;
        Ok(())
    }

    async fn confirm_block(&self, hash: &Hash256) -> Result<()> {
        let mut inner = self.inner.lock();
        let block = inner.block_mut(hash)?;
        if block.status.is_terminal() {
            return Err(Error::store(format!("block {} is already {}", hash, block.status)));
        }
        block.status = BlockStatus::Confirmed;

        let payouts = inner.payouts.get(hash).cloned().unwrap_or_default();
        for payout in payouts {
            let balance = inner.balances.entry(payout.miner).or_default();
            balance.immature = balance.immature.saturating_sub(payout.amount);
            balance.mature += payout.amount;
        }
        Ok(())
    }

    async fn orphan_block(&self, hash: &Hash256) -> Result<()> {
        let mut inner = self.inner.lock();
        let block = inner.block_mut(hash)?;
        if block.status.is_terminal() {
            return Err(Error::store(format!("block {} is already {}", hash, block.status)));
        }
        block.status = BlockStatus::Orphaned;

        let payouts = inner.payouts.get(hash).cloned().unwrap_or_default();
        for payout in payouts {
            let balance = inner.balances.entry(payout.miner).or_default();
            balance.immature = balance.immature.saturating_sub(payout.amount);
        }
        Ok(())
    }

    async fn balance(&self, miner: MinerId) -> Result<Balance> {
        Ok(self
            .inner
            .lock()
            .balances
            .get(&miner)
            .copied()
            .unwrap_or_default())
    }

    async fn save_round_progress(
        &self,
        scheme: RewardScheme,
        snapshot: &RoundSnapshot,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(saved) = inner.rounds.get(&scheme) {
            if snapshot.block_number < saved.block_number {
                return Err(Error::store(format!(
                    "progress of round {} is older than round {}",
                    snapshot.block_number, saved.block_number
                )));
            }
        }
        inner.rounds.insert(scheme, snapshot.clone());
        Ok(())
    }

    async fn load_round_progress(&self, scheme: RewardScheme) -> Result<Option<RoundSnapshot>> {
        Ok(self.round_progress(scheme))
    }
}
