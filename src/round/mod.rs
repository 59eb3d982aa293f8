//! Round and payout accounting
//!
//! A round accumulates effort per miner from the last found block to the
//! next. The [`accountant::Accountant`] owns the live ledger and closes
//! rounds against the durable store.

pub mod accountant;
pub mod payout;

pub use accountant::{Accountant, BlockFound};
pub use payout::{prop_rewards, MinerReward, PplnsWindow, WindowShare};

use crate::types::MinerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Reward scheme selected per deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RewardScheme {
    /// Proportional to effort within the round
    Prop,
    /// Pay per last N difficulty units
    Pplns,
}

impl fmt::Display for RewardScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewardScheme::Prop => write!(f, "prop"),
            RewardScheme::Pplns => write!(f, "pplns"),
        }
    }
}

/// Effort ledger of the open round
///
/// `total_effort` always equals the sum of per-miner effort.
#[derive(Debug, Clone, Default)]
pub struct Round {
    efforts: HashMap<MinerId, f64>,
    total_effort: f64,
    started_at: u64,
    block_number: u64,
}

impl Round {
    pub fn new(started_at: u64, block_number: u64) -> Self {
        Self {
            efforts: HashMap::new(),
            total_effort: 0.0,
            started_at,
            block_number,
        }
    }

    /// Add effort for one miner
    pub fn credit(&mut self, miner: MinerId, effort: f64) {
        if !(effort.is_finite() && effort > 0.0) {
            return;
        }
        *self.efforts.entry(miner).or_insert(0.0) += effort;
        self.total_effort += effort;
    }

    pub fn total_effort(&self) -> f64 {
        self.total_effort
    }

    pub fn effort_of(&self, miner: MinerId) -> f64 {
        self.efforts.get(&miner).copied().unwrap_or(0.0)
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    /// Number of blocks closed so far
    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    /// Copy of the ledger at this instant
    pub fn snapshot(&self) -> RoundSnapshot {
        let mut efforts: Vec<(MinerId, f64)> =
            self.efforts.iter().map(|(m, e)| (*m, *e)).collect();
        efforts.sort_by_key(|(miner, _)| *miner);
        RoundSnapshot {
            efforts,
            total_effort: self.total_effort,
            started_at: self.started_at,
            block_number: self.block_number,
            window_progress: 0.0,
            window: Vec::new(),
        }
    }

    /// Remove a committed snapshot, keeping effort credited since it was taken
    pub fn close(&mut self, committed: &RoundSnapshot, started_at: u64) {
        for (miner, effort) in &committed.efforts {
            if let Some(current) = self.efforts.get_mut(miner) {
                *current -= effort;
                if *current <= f64::EPSILON * effort.max(1.0) {
                    self.efforts.remove(miner);
                }
            }
        }
        self.total_effort = if self.efforts.is_empty() {
            0.0
        } else {
            self.efforts.values().sum()
        };
        self.started_at = started_at;
        self.block_number = committed.block_number + 1;
    }
}

/// Immutable copy of a round's ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    /// Per-miner effort, sorted by miner id
    pub efforts: Vec<(MinerId, f64)>,
    pub total_effort: f64,
    pub started_at: u64,
    pub block_number: u64,
    /// PPLNS progress counter; zero under PROP
    #[serde(default)]
    pub window_progress: f64,
    /// PPLNS shares still inside the window, oldest first
    #[serde(default)]
    pub window: Vec<WindowShare>,
}
