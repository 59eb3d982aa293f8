//! Per-session difficulty retargeting
//!
//! Each pass compares a session's observed share rate with the target rate
//! and proposes a new difficulty. Proposals become the session's *pending*
//! difficulty; the server activates them at the next job broadcast.

use crate::utils::clamp;
use crate::{Error, Result};
use std::time::Duration;
use tracing::debug;

/// Retargeting policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VardiffConfig {
    /// Desired accepted shares per minute per session
    pub target_shares_per_minute: f64,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
    /// Relative change below which the difficulty is left alone
    pub variance: f64,
    /// Largest factor applied in one pass, in either direction
    pub max_factor: f64,
    /// Minimum time between two retargets of the same session
    pub retarget_interval: Duration,
}

impl Default for VardiffConfig {
    fn default() -> Self {
        Self {
            target_shares_per_minute: 20.0,
            min_difficulty: 1.0,
            max_difficulty: 1e12,
            variance: 0.1,
            max_factor: 8.0,
            retarget_interval: Duration::from_secs(90),
        }
    }
}

impl VardiffConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.target_shares_per_minute > 0.0) {
            return Err(Error::config("target shares per minute must be positive"));
        }
        if !(self.min_difficulty > 0.0) || self.min_difficulty > self.max_difficulty {
            return Err(Error::config(format!(
                "invalid difficulty range [{}, {}]",
                self.min_difficulty, self.max_difficulty
            )));
        }
        if !(0.0..1.0).contains(&self.variance) {
            return Err(Error::config("variance must be in [0, 1)"));
        }
        if !(self.max_factor > 1.0) {
            return Err(Error::config("max retarget factor must exceed 1"));
        }
        Ok(())
    }

    /// Clamp a difficulty into the configured range
    pub fn bound(&self, difficulty: f64) -> f64 {
        clamp(difficulty, self.min_difficulty, self.max_difficulty)
    }

    /// Proposed difficulty after observing `shares` over `elapsed`
    ///
    /// Returns `None` when too little time has passed or the change stays
    /// within the variance band.
    pub fn retarget(&self, current: f64, shares: u32, elapsed: Duration) -> Option<f64> {
        if elapsed < self.retarget_interval || elapsed.is_zero() || current <= 0.0 {
            return None;
        }

        let minutes = elapsed.as_secs_f64() / 60.0;
        let rate = shares as f64 / minutes;
        let multiplier = clamp(
            rate / self.target_shares_per_minute,
            1.0 / self.max_factor,
            self.max_factor,
        );
        let candidate = self.bound(current * multiplier);

        let change = (candidate - current).abs() / current;
        debug!(
            target: "vardiff",
            shares,
            elapsed_secs = elapsed.as_secs(),
            rate,
            current,
            candidate,
            "Retarget check"
        );
        if change > self.variance {
            Some(candidate)
        } else {
            None
        }
    }
}
