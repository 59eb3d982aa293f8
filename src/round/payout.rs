//! Reward scheme arithmetic
//!
//! Both schemes compute integer amounts by rounding down, so a block's
//! distributable reward is never over-paid. Whatever rounding leaves over
//! stays with the pool.

use crate::types::MinerId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// A computed reward for one miner
#[derive(Debug, Clone, PartialEq)]
pub struct MinerReward {
    pub miner: MinerId,
    /// Fraction of the distributable reward, in `[0, 1]`
    pub share: f64,
    /// Amount in base units
    pub amount: u64,
}

/// Split `block_reward` into the pool fee and the distributable remainder
pub fn split_fee(block_reward: u64, fee: f64) -> (u64, u64) {
    let fee_amount = ((block_reward as f64) * fee.clamp(0.0, 1.0)).round() as u64;
    let fee_amount = fee_amount.min(block_reward);
    (fee_amount, block_reward - fee_amount)
}

/// Turn per-miner fractions into floored amounts
///
/// Fractions are expected to sum to one. Floating point noise that would
/// push the total above `distributable` is taken back from the largest
/// amounts.
pub fn amounts_from_fractions(fractions: &[(MinerId, f64)], distributable: u64) -> Vec<MinerReward> {
    let mut rewards: Vec<MinerReward> = fractions
        .iter()
        .map(|&(miner, share)| MinerReward {
            miner,
            share,
            amount: ((distributable as f64) * share).floor().max(0.0) as u64,
        })
        .collect();

    let mut total: u64 = rewards.iter().map(|r| r.amount).sum();
    while total > distributable {
        let Some(largest) = rewards.iter_mut().max_by_key(|r| r.amount) else {
            break;
        };
        largest.amount -= 1;
        total -= 1;
    }

    rewards
}

/// Proportional rewards over one round's effort ledger
pub fn prop_rewards(
    efforts: &[(MinerId, f64)],
    total_effort: f64,
    block_reward: u64,
    fee: f64,
) -> Result<Vec<MinerReward>> {
    if !(total_effort > 0.0) {
        return Err(Error::accounting("round has zero total effort"));
    }

    let (_, distributable) = split_fee(block_reward, fee);
    let fractions: Vec<(MinerId, f64)> = efforts
        .iter()
        .filter(|(_, effort)| *effort > 0.0)
        .map(|&(miner, effort)| (miner, effort / total_effort))
        .collect();

    Ok(amounts_from_fractions(&fractions, distributable))
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ShareRecord {
    miner: MinerId,
    effort: f64,
    /// Cumulative progress at the end of this share
    end: f64,
}

/// One persisted share of the PPLNS window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowShare {
    pub miner: MinerId,
    pub effort: f64,
}

/// Trailing window of share effort for PPLNS
///
/// The window size is measured in difficulty units. Shares older than the
/// window are pruned as new ones arrive, so memory stays proportional to
/// the window, not to the round.
#[derive(Debug, Clone)]
pub struct PplnsWindow {
    window: f64,
    progress: f64,
    history: VecDeque<ShareRecord>,
}

impl PplnsWindow {
    /// Create a window of `window` difficulty units
    pub fn new(window: f64) -> Result<Self> {
        if !(window.is_finite() && window > 0.0) {
            return Err(Error::config("PPLNS window must be positive"));
        }
        Ok(Self {
            window,
            progress: 0.0,
            history: VecDeque::new(),
        })
    }

    pub fn window(&self) -> f64 {
        self.window
    }

    /// Running progress counter; never decreases
    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Shares still inside the window, oldest first
    pub fn shares(&self) -> Vec<WindowShare> {
        self.history
            .iter()
            .map(|record| WindowShare {
                miner: record.miner,
                effort: record.effort,
            })
            .collect()
    }

    /// Reload persisted shares ending at `progress`
    ///
    /// Replaces the current history. The progress counter continues from
    /// the persisted value rather than restarting at zero.
    pub fn restore(&mut self, progress: f64, shares: &[WindowShare]) {
        let total: f64 = shares.iter().map(|share| share.effort).sum();
        self.history.clear();
        self.progress = (progress - total).max(0.0);
        for share in shares {
            self.record(share.miner, share.effort);
        }
        if progress.is_finite() && progress > self.progress {
            self.progress = progress;
        }
    }

    /// Append a share
    pub fn record(&mut self, miner: MinerId, effort: f64) {
        if !(effort > 0.0) {
            return;
        }
        self.progress += effort;
        self.history.push_back(ShareRecord {
            miner,
            effort,
            end: self.progress,
        });

        let horizon = self.progress - self.window;
        while let Some(front) = self.history.front() {
            if front.end <= horizon {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Per-miner fraction of the trailing window, summing to one
    ///
    /// The oldest share inside the window is cut so the window holds exactly
    /// `window` units. A history shorter than the window is paid in full.
    pub fn fractions(&self) -> Result<Vec<(MinerId, f64)>> {
        let mut contributions: BTreeMap<MinerId, f64> = BTreeMap::new();
        let mut accumulated = 0.0;

        for record in self.history.iter().rev() {
            let remaining = self.window - accumulated;
            if remaining <= 0.0 {
                break;
            }
            let counted = record.effort.min(remaining);
            *contributions.entry(record.miner).or_insert(0.0) += counted;
            accumulated += counted;
        }

        if !(accumulated > 0.0) {
            return Err(Error::accounting("PPLNS window holds no shares"));
        }

        Ok(contributions
            .into_iter()
            .map(|(miner, effort)| (miner, effort / accumulated))
            .collect())
    }

    /// Rewards over the trailing window
    pub fn rewards(&self, block_reward: u64, fee: f64) -> Result<Vec<MinerReward>> {
        let fractions = self.fractions()?;
        let (_, distributable) = split_fee(block_reward, fee);
        Ok(amounts_from_fractions(&fractions, distributable))
    }
}
