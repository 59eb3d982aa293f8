//! Share validation
//!
//! A share is one miner's claimed proof of work for a live job. Validation
//! yields a [`ShareOutcome`]; rejections are ordinary outcomes, not errors.

pub mod difficulty;
pub mod validator;

pub use validator::{CandidateBlock, ShareValidator, ValidatedShare};

use std::fmt;

/// Classification of one submitted share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShareOutcome {
    /// The session has not completed authorization
    Unauthorized,
    Duplicate,
    StaleJob,
    BadTime,
    LowDifficulty,
    ValidShare,
    ValidBlock,
}

impl ShareOutcome {
    /// Whether the share is credited
    pub fn is_accepted(&self) -> bool {
        matches!(self, ShareOutcome::ValidShare | ShareOutcome::ValidBlock)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShareOutcome::Unauthorized => "unauthorized",
            ShareOutcome::Duplicate => "duplicate",
            ShareOutcome::StaleJob => "stale_job",
            ShareOutcome::BadTime => "bad_time",
            ShareOutcome::LowDifficulty => "low_difficulty",
            ShareOutcome::ValidShare => "valid_share",
            ShareOutcome::ValidBlock => "valid_block",
        }
    }
}

impl fmt::Display for ShareOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed `mining.submit`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShareSubmission {
    pub worker: String,
    pub job_id: String,
    /// Bitcoin: extranonce2; Equihash: the miner's part of the header nonce
    pub extranonce2: Vec<u8>,
    pub time: u32,
    /// Bitcoin header nonce; empty for Equihash
    pub nonce: Vec<u8>,
    /// Compact-size prefixed Equihash solution; empty for Bitcoin
    pub solution: Vec<u8>,
}
