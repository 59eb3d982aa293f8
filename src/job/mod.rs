//! Jobs and the live job set
//!
//! A [`Job`] is immutable once published and shared as `Arc<Job>`. The
//! [`JobManager`] owns the job id counter and the set of jobs that still
//! accept submissions; validators read it concurrently while template
//! refreshes take the write lock.

pub mod coinbase;
pub mod encoding;
pub mod family;
pub mod layout;
pub mod merkle;
pub mod template;

pub use family::{CoinFamily, PatchedShare};
pub use template::{JobBuilder, JobBuilderConfig, PreparedTemplate};

use crate::chain::BlockTemplate;
use crate::crypto::Hash256;
use crate::Result;
use coinbase::CoinbaseParts;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Job identifier, rendered as fixed-width hex on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        u32::from_str_radix(s, 16).map(JobId)
    }
}

/// One unit of work derived from a block template
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub family: CoinFamily,
    pub height: u64,
    pub prev_hash: Hash256,
    pub version: u32,
    pub bits: u32,
    /// Template time, also the header time skeleton
    pub time: u32,
    /// Earliest share time the chain accepts
    pub min_time: u32,
    /// Network difficulty; shares at or above it are blocks
    pub difficulty: f64,
    /// Coinbase value paid to the pool
    pub reward: u64,
    pub coinbase: CoinbaseParts,
    pub merkle_branches: Vec<Hash256>,
    /// Set when the coinbase does not change per share
    pub fixed_merkle_root: Option<Hash256>,
    pub commitment_root: Hash256,
    /// Header skeleton
    pub header: Vec<u8>,
    /// Serialized non-coinbase transactions
    pub transactions: Vec<u8>,
    /// Transaction count including the coinbase
    pub tx_count: usize,
    /// Whether the block carries a witness commitment
    pub witness: bool,
    pub clean: bool,
    pub fingerprint: Hash256,
    pub created_at: u64,
    /// Pre-rendered `mining.notify` line
    pub notify_line: String,
}

#[derive(Debug, Default)]
struct LiveJobs {
    jobs: HashMap<JobId, Arc<Job>>,
    latest: Option<Arc<Job>>,
}

/// Owns the live job set
#[derive(Debug)]
pub struct JobManager {
    builder: JobBuilder,
    max_live_jobs: usize,
    next_id: AtomicU32,
    live: RwLock<LiveJobs>,
}

impl JobManager {
    pub fn new(builder: JobBuilder, max_live_jobs: usize) -> Self {
        Self {
            builder,
            max_live_jobs: max_live_jobs.max(1),
            next_id: AtomicU32::new(1),
            live: RwLock::new(LiveJobs::default()),
        }
    }

    pub fn family(&self) -> CoinFamily {
        self.builder.family()
    }

    /// Turn a fresh template into a job
    ///
    /// Returns `None` when the template has the same content as the active
    /// job. A new height or previous hash yields a clean job that retires
    /// every older one. Only clean jobs retire anything: once `max_live_jobs`
    /// are live, the next update is published as clean so miners are told to
    /// drop their old work.
    pub fn process_template(&self, template: BlockTemplate, now: u64) -> Result<Option<Arc<Job>>> {
        let prepared = self.builder.prepare(template)?;

        let clean = {
            let live = self.live.read();
            match &live.latest {
                Some(latest) if latest.fingerprint == prepared.fingerprint => {
                    debug!(height = latest.height, "Template unchanged");
                    return Ok(None);
                }
                Some(latest) => {
                    let new_block = latest.height != prepared.template.height
                        || latest.prev_hash != prepared.prev_hash;
                    if !new_block && live.jobs.len() >= self.max_live_jobs {
                        debug!(live = live.jobs.len(), "Live job limit reached, resetting work");
                    }
                    new_block || live.jobs.len() >= self.max_live_jobs
                }
                None => true,
            }
        };

        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let job = Arc::new(self.builder.build(prepared, id, clean, now)?);

        let mut live = self.live.write();
        if clean {
            live.jobs.clear();
        }
        live.jobs.insert(job.id, job.clone());
        live.latest = Some(job.clone());
        drop(live);

        info!(
            job_id = %job.id,
            height = job.height,
            clean = job.clean,
            transactions = job.tx_count - 1,
            difficulty = job.difficulty,
            "New job"
        );
        Ok(Some(job))
    }

    /// Live job by wire id
    pub fn get(&self, job_id: &str) -> Option<Arc<Job>> {
        let id = job_id.parse::<JobId>().ok()?;
        self.live.read().jobs.get(&id).cloned()
    }

    pub fn latest(&self) -> Option<Arc<Job>> {
        self.live.read().latest.clone()
    }

    pub fn live_count(&self) -> usize {
        self.live.read().jobs.len()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{builder, sample_template};
    use super::*;

    fn manager() -> JobManager {
        JobManager::new(builder(CoinFamily::Bitcoin), 3)
    }

    #[test]
    fn test_job_id_format() {
        assert_eq!(JobId(1).to_string(), "00000001");
        assert_eq!(JobId(0xdeadbeef).to_string(), "deadbeef");
        assert_eq!("0000002a".parse::<JobId>().unwrap(), JobId(42));
        assert!("zz".parse::<JobId>().is_err());
    }

    #[test]
    fn test_identical_template_yields_no_job() {
        let jobs = manager();
        let template = sample_template(CoinFamily::Bitcoin, false);
        let first = jobs.process_template(template.clone(), 0).unwrap().unwrap();
        assert!(first.clean);

        let mut later = template;
        later.cur_time += 10;
        assert!(jobs.process_template(later, 5).unwrap().is_none());
        assert_eq!(jobs.latest().unwrap().id, first.id);
    }

    #[test]
    fn test_same_height_update_is_not_clean() {
        let jobs = manager();
        let template = sample_template(CoinFamily::Bitcoin, false);
        let first = jobs.process_template(template.clone(), 0).unwrap().unwrap();

        let mut update = template;
        update.transactions.pop();
        update.coinbase_value -= 2_000;
        let second = jobs.process_template(update, 1).unwrap().unwrap();
        assert!(!second.clean);
        assert!(second.id > first.id);
        assert!(jobs.get(&first.id.to_string()).is_some());
        assert!(jobs.get(&second.id.to_string()).is_some());
    }

    #[test]
    fn test_clean_job_retires_older_jobs() {
        let jobs = manager();
        let template = sample_template(CoinFamily::Bitcoin, false);
        let first = jobs.process_template(template.clone(), 0).unwrap().unwrap();

        let mut next = template;
        next.height += 1;
        next.previous_block_hash =
            "0000000000000000000320283a032748cef8227873ff4872689bf23f1cda83a5".into();
        let second = jobs.process_template(next, 1).unwrap().unwrap();
        assert!(second.clean);
        assert!(jobs.get(&first.id.to_string()).is_none());
        assert_eq!(jobs.live_count(), 1);
    }

    #[test]
    fn test_updates_never_retire_jobs_unless_clean() {
        let jobs = manager();
        let mut template = sample_template(CoinFamily::Bitcoin, false);
        let mut all = Vec::new();
        let mut since_clean: Vec<JobId> = Vec::new();
        for i in 0..7u64 {
            template.coinbase_value += i + 1;
            let job = jobs.process_template(template.clone(), i).unwrap().unwrap();
            if job.clean {
                since_clean.clear();
            } else {
                for id in &since_clean {
                    assert!(jobs.get(&id.to_string()).is_some(), "job {} retired", id);
                }
            }
            since_clean.push(job.id);
            all.push((job.id, job.clean));
        }

        // With a limit of three, every third update is published clean
        let clean: Vec<bool> = all.iter().map(|(_, clean)| *clean).collect();
        assert_eq!(clean, vec![true, false, false, true, false, false, true]);
        assert_eq!(jobs.live_count(), 1);
        assert!(jobs.get(&all[5].0.to_string()).is_none());
    }
}
