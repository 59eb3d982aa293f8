//! Share validation hot path
//!
//! Gates run in a fixed order and each one can end validation early. The
//! proof-of-work hash is computed exactly once per share.

use super::difficulty::hash_to_difficulty;
use super::{ShareOutcome, ShareSubmission};
use crate::crypto::{HashFunction, Hash256};
use crate::job::{Job, JobManager};
use crate::stratum::session::Session;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// A winning share, ready for submission
#[derive(Debug, Clone)]
pub struct CandidateBlock {
    pub job: Arc<Job>,
    pub hash: Hash256,
    /// Serialized block, hex
    pub hex: String,
    /// Difficulty the share actually reached
    pub difficulty: f64,
}

/// Result of validating one share
#[derive(Debug, Clone)]
pub struct ValidatedShare {
    pub outcome: ShareOutcome,
    /// Effort credited to the round; zero unless accepted
    pub effort: f64,
    /// Difficulty of the share's hash, when it was computed
    pub share_difficulty: Option<f64>,
    pub block: Option<CandidateBlock>,
}

impl ValidatedShare {
    fn rejected(outcome: ShareOutcome, share_difficulty: Option<f64>) -> Self {
        Self {
            outcome,
            effort: 0.0,
            share_difficulty,
            block: None,
        }
    }
}

/// Validates shares for one coin family
pub struct ShareValidator {
    hasher: Arc<dyn HashFunction>,
    max_future_skew: Duration,
    low_difficulty_tolerance: f64,
}

impl std::fmt::Debug for ShareValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareValidator")
            .field("hasher", &self.hasher.name())
            .field("max_future_skew", &self.max_future_skew)
            .field("low_difficulty_tolerance", &self.low_difficulty_tolerance)
            .finish()
    }
}

impl ShareValidator {
    pub fn new(
        hasher: Arc<dyn HashFunction>,
        max_future_skew: Duration,
        low_difficulty_tolerance: f64,
    ) -> Self {
        Self {
            hasher,
            max_future_skew,
            low_difficulty_tolerance,
        }
    }

    /// Classify one share
    ///
    /// Rejections are returned as outcomes. `Err` means the submission
    /// itself was malformed for the job it names.
    pub fn validate(
        &self,
        session: &Session,
        jobs: &JobManager,
        share: &ShareSubmission,
        now: u64,
    ) -> Result<ValidatedShare> {
        if !session.is_authorized() {
            return Ok(ValidatedShare::rejected(ShareOutcome::Unauthorized, None));
        }

        let job = match jobs.get(&share.job_id) {
            Some(job) => job,
            None => return Ok(ValidatedShare::rejected(ShareOutcome::StaleJob, None)),
        };

        let latest_time = now.saturating_add(self.max_future_skew.as_secs());
        if share.time < job.min_time || u64::from(share.time) > latest_time {
            return Ok(ValidatedShare::rejected(ShareOutcome::BadTime, None));
        }

        let family = job.family;
        let patched = family.patch_header(&job, session.extranonce1(), share)?;
        let hash = self.hasher.hash(&patched.hash_input);

        if !session.remember_share(hash.fingerprint()) {
            return Ok(ValidatedShare::rejected(ShareOutcome::Duplicate, None));
        }

        let share_difficulty = hash_to_difficulty(&hash, family.diff1_bits());
        let session_difficulty = session.difficulty();

        if share_difficulty >= job.difficulty {
            let block = family.serialize_block(&job, &patched)?;
            return Ok(ValidatedShare {
                outcome: ShareOutcome::ValidBlock,
                effort: share_difficulty,
                share_difficulty: Some(share_difficulty),
                block: Some(CandidateBlock {
                    hash: patched.block_hash(),
                    hex: hex::encode(block),
                    difficulty: share_difficulty,
                    job,
                }),
            });
        }

        if share_difficulty < session_difficulty * (1.0 - self.low_difficulty_tolerance) {
            return Ok(ValidatedShare::rejected(
                ShareOutcome::LowDifficulty,
                Some(share_difficulty),
            ));
        }

        Ok(ValidatedShare {
            outcome: ShareOutcome::ValidShare,
            effort: share_difficulty,
            share_difficulty: Some(share_difficulty),
            block: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Sha256d;
    use crate::job::test_support::{builder, sample_template};
    use crate::job::CoinFamily;
    use crate::stratum::session::test_support::{authorized_session, session};
    use assert_matches::assert_matches;

    /// Returns a fixed digest regardless of input
    struct FixedHash(Hash256);

    impl HashFunction for FixedHash {
        fn hash(&self, _data: &[u8]) -> Hash256 {
            self.0
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    /// Digest whose big-endian form starts with `zeros` zero bytes
    fn hash_with_leading_zero_bytes(zeros: usize) -> Hash256 {
        let mut be = [0xffu8; 32];
        be[..zeros].fill(0);
        be.reverse();
        Hash256::from_bytes(be)
    }

    fn jobs() -> JobManager {
        let jobs = JobManager::new(builder(CoinFamily::Bitcoin), 4);
        jobs.process_template(sample_template(CoinFamily::Bitcoin, false), 0)
            .unwrap();
        jobs
    }

    fn share(jobs: &JobManager, extranonce2: u8) -> ShareSubmission {
        let job = jobs.latest().unwrap();
        ShareSubmission {
            worker: "addr.rig".into(),
            job_id: job.id.to_string(),
            extranonce2: vec![0, 0, 0, extranonce2],
            time: job.time,
            nonce: vec![0, 0, 0, 0],
            solution: vec![],
        }
    }

    fn validator(hasher: impl HashFunction + 'static) -> ShareValidator {
        ShareValidator::new(Arc::new(hasher), Duration::from_secs(7200), 0.01)
    }

    #[test]
    fn test_unauthorized_session() {
        let jobs = jobs();
        let (s, _rx) = session(1.0);
        let v = validator(Sha256d);
        let result = v.validate(&s, &jobs, &share(&jobs, 1), 0).unwrap();
        assert_eq!(result.outcome, ShareOutcome::Unauthorized);
    }

    #[test]
    fn test_stale_job() {
        let jobs = jobs();
        let (s, _rx) = authorized_session(1.0);
        let mut submission = share(&jobs, 1);
        submission.job_id = "deadbeef".into();
        let result = validator(Sha256d).validate(&s, &jobs, &submission, 0).unwrap();
        assert_eq!(result.outcome, ShareOutcome::StaleJob);
    }

    #[test]
    fn test_time_window() {
        let jobs = jobs();
        let (s, _rx) = authorized_session(1.0);
        let job = jobs.latest().unwrap();
        let v = validator(Sha256d);
        let now = u64::from(job.time);

        let mut early = share(&jobs, 1);
        early.time = job.min_time - 1;
        assert_eq!(v.validate(&s, &jobs, &early, now).unwrap().outcome, ShareOutcome::BadTime);

        let mut late = share(&jobs, 1);
        late.time = job.time + 7201;
        assert_eq!(v.validate(&s, &jobs, &late, now).unwrap().outcome, ShareOutcome::BadTime);
    }

    #[test]
    fn test_valid_share_then_duplicate() {
        let jobs = jobs();
        let (s, _rx) = authorized_session(1.0);
        // Difficulty 2^8 against a network difficulty of 1 would be a block,
        // so use a hash right between session and network difficulty
        let v = validator(FixedHash(hash_with_leading_zero_bytes(3)));
        let submission = share(&jobs, 1);
        let now = u64::from(jobs.latest().unwrap().time);

        s.set_difficulty(1e-4);
        let first = v.validate(&s, &jobs, &submission, now).unwrap();
        assert_matches!(first.outcome, ShareOutcome::ValidShare);
        // Credited at the difficulty the hash reached, not the session's
        assert_eq!(Some(first.effort), first.share_difficulty);
        assert!(first.effort > 1e-4);

        let second = v.validate(&s, &jobs, &submission, now).unwrap();
        assert_matches!(second.outcome, ShareOutcome::Duplicate);
        assert_eq!(second.effort, 0.0);
    }

    #[test]
    fn test_low_difficulty_with_tolerance() {
        let jobs = jobs();
        let (s, _rx) = authorized_session(1.0);
        let v = validator(FixedHash(hash_with_leading_zero_bytes(2)));
        let now = u64::from(jobs.latest().unwrap().time);

        let result = v.validate(&s, &jobs, &share(&jobs, 1), now).unwrap();
        assert_matches!(result.outcome, ShareOutcome::LowDifficulty);
        let reached = result.share_difficulty.unwrap();
        assert!(reached > 0.0 && reached < 1.0);

        // Just inside the tolerance band is still accepted
        s.clear_duplicates();
        s.set_difficulty(reached * 1.005);
        let result = v.validate(&s, &jobs, &share(&jobs, 2), now).unwrap();
        assert_matches!(result.outcome, ShareOutcome::ValidShare);
    }

    #[test]
    fn test_block_candidate() {
        let jobs = jobs();
        let (s, _rx) = authorized_session(1.0);
        let v = validator(FixedHash(hash_with_leading_zero_bytes(5)));
        let now = u64::from(jobs.latest().unwrap().time);

        let result = v.validate(&s, &jobs, &share(&jobs, 3), now).unwrap();
        assert_matches!(result.outcome, ShareOutcome::ValidBlock);
        assert_eq!(Some(result.effort), result.share_difficulty);
        assert!(result.effort >= 1.0);
        let block = result.block.unwrap();
        assert!(block.difficulty >= block.job.difficulty);
        let bytes = hex::decode(&block.hex).unwrap();
        assert_eq!(crate::crypto::sha256d(&bytes[..80]), block.hash);
        assert!(bytes.ends_with(&block.job.transactions));
    }

    #[test]
    fn test_clean_job_makes_old_shares_stale() {
        let jobs = jobs();
        let (s, _rx) = authorized_session(1e-4);
        let v = validator(FixedHash(hash_with_leading_zero_bytes(3)));
        let old = share(&jobs, 1);
        let now = u64::from(jobs.latest().unwrap().time);

        let mut next = sample_template(CoinFamily::Bitcoin, false);
        next.height += 1;
        next.previous_block_hash =
            "0000000000000000000320283a032748cef8227873ff4872689bf23f1cda83a5".into();
        jobs.process_template(next, 1).unwrap().unwrap();

        let result = v.validate(&s, &jobs, &old, now).unwrap();
        assert_eq!(result.outcome, ShareOutcome::StaleJob);
    }

    #[test]
    fn test_malformed_extranonce_is_an_error() {
        let jobs = jobs();
        let (s, _rx) = authorized_session(1.0);
        let mut submission = share(&jobs, 1);
        submission.extranonce2 = vec![1, 2];
        let now = u64::from(jobs.latest().unwrap().time);
        assert!(validator(Sha256d).validate(&s, &jobs, &submission, now).is_err());
    }
}
