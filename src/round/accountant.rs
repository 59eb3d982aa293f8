//! Live effort ledger and round closure
//!
//! Shares credit effort under a short-held lock. Closing a round takes a
//! snapshot, computes rewards and commits them to the store without holding
//! the ledger lock; the snapshot is only subtracted once the commit has
//! succeeded, so a failed commit leaves the round open and shares credited
//! meanwhile are never lost.

use super::payout::{prop_rewards, MinerReward, PplnsWindow};
use super::{RewardScheme, Round, RoundSnapshot};
use crate::crypto::Hash256;
use crate::store::{BlockRecord, PayoutEntry, PoolStore, RoundClosure};
use crate::types::{BlockStatus, MinerId, WorkerId};
use crate::utils::current_timestamp_secs;
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// A block accepted by the node, ready to close the round
#[derive(Debug, Clone, PartialEq)]
pub struct BlockFound {
    pub height: u64,
    pub hash: Hash256,
    pub reward: u64,
    pub difficulty: f64,
    pub finder: MinerId,
    pub worker: WorkerId,
    pub found_at: u64,
}

/// Owner of the effort ledger for one reward scheme
pub struct Accountant {
    scheme: RewardScheme,
    fee: f64,
    round: Mutex<Round>,
    window: Option<Mutex<PplnsWindow>>,
    closing: tokio::sync::Mutex<()>,
    store: Arc<dyn PoolStore>,
}

impl Accountant {
    /// Create an accountant; `pplns_window` is required for PPLNS
    pub fn new(
        scheme: RewardScheme,
        fee: f64,
        pplns_window: f64,
        store: Arc<dyn PoolStore>,
    ) -> Result<Self> {
        let window = match scheme {
            RewardScheme::Prop => None,
            RewardScheme::Pplns => Some(Mutex::new(PplnsWindow::new(pplns_window)?)),
        };
        Ok(Self {
            scheme,
            fee,
            round: Mutex::new(Round::new(current_timestamp_secs(), 0)),
            window,
            closing: tokio::sync::Mutex::new(()),
            store,
        })
    }

    /// Continue from persisted progress, including the PPLNS window
    pub fn restore(&self, snapshot: &RoundSnapshot) {
        {
            let mut round = self.round.lock();
            *round = Round::new(snapshot.started_at, snapshot.block_number);
            for (miner, effort) in &snapshot.efforts {
                round.credit(*miner, *effort);
            }
        }
        if let Some(window) = &self.window {
            window
                .lock()
                .restore(snapshot.window_progress, &snapshot.window);
        }
    }

    pub fn scheme(&self) -> RewardScheme {
        self.scheme
    }

    /// Credit one accepted share
    pub fn credit(&self, miner: MinerId, effort: f64) {
        self.round.lock().credit(miner, effort);
        if let Some(window) = &self.window {
            window.lock().record(miner, effort);
        }
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        let mut snapshot = self.round.lock().snapshot();
        if let Some(window) = &self.window {
            let window = window.lock();
            snapshot.window_progress = window.progress();
            snapshot.window = window.shares();
        }
        snapshot
    }

    pub fn total_effort(&self) -> f64 {
        self.round.lock().total_effort()
    }

    /// Persist the open round's progress
    ///
    /// Serialized with round closes so a snapshot taken before a close is
    /// never written over the progress of the round that follows it.
    pub async fn flush(&self) -> Result<()> {
        let _closing = self.closing.lock().await;
        let snapshot = self.snapshot();
        self.store.save_round_progress(self.scheme, &snapshot).await
    }

    fn rewards(&self, snapshot: &RoundSnapshot, block_reward: u64) -> Result<Vec<MinerReward>> {
        match &self.window {
            None => prop_rewards(&snapshot.efforts, snapshot.total_effort, block_reward, self.fee),
            Some(window) => window.lock().rewards(block_reward, self.fee),
        }
    }

    /// Close the round for `found`
    ///
    /// Fails without side effects when the round has no effort or the store
    /// rejects the commit.
    #[instrument(skip(self, found), fields(height = found.height, hash = %found.hash))]
    pub async fn close_round(&self, found: BlockFound) -> Result<RoundClosure> {
        let _closing = self.closing.lock().await;

        let snapshot = self.snapshot();
        let rewards = match self.rewards(&snapshot, found.reward) {
            Ok(rewards) => rewards,
            Err(e) => {
                warn!("Round {} not closed: {}", snapshot.block_number, e);
                return Err(e);
            }
        };

        let next_round_start = current_timestamp_secs();
        let next_round = RoundSnapshot {
            efforts: Vec::new(),
            total_effort: 0.0,
            started_at: next_round_start,
            block_number: snapshot.block_number + 1,
            window_progress: snapshot.window_progress,
            window: snapshot.window.clone(),
        };
        let closure = RoundClosure {
            scheme: self.scheme,
            block: BlockRecord {
                height: found.height,
                hash: found.hash,
                reward: found.reward,
                difficulty: found.difficulty,
                effort: snapshot.total_effort,
                status: BlockStatus::Pending,
                finder: found.finder,
                worker: found.worker,
                found_at: found.found_at,
                block_number: snapshot.block_number,
            },
            payouts: rewards
                .iter()
                .map(|r| PayoutEntry {
                    miner: r.miner,
                    block_hash: found.hash,
                    amount: r.amount,
                    share: r.share,
                })
                .collect(),
            next_round,
        };

        if let Err(e) = self.store.commit_round(&closure).await {
            warn!("Round {} commit failed, round stays open: {}", snapshot.block_number, e);
            return Err(e);
        }

        self.round.lock().close(&snapshot, next_round_start);

        info!(
            "Closed round {} ({} scheme): effort {:.4}, {} payouts",
            snapshot.block_number,
            self.scheme,
            snapshot.total_effort,
            closure.payouts.len()
        );
        Ok(closure)
    }
}
