//! Block submission and maturity tracking
//!
//! Winning shares are submitted to the node and, once accepted, close the
//! current round. A periodic pass then follows every immature block until
//! it is confirmed (payouts mature) or orphaned (payouts reversed).

use crate::chain::{ChainNode, HeaderStatus};
use crate::round::{Accountant, BlockFound};
use crate::share::CandidateBlock;
use crate::store::{BlockRecord, PoolStore, RoundClosure};
use crate::stratum::session::SessionIdentity;
use crate::types::BlockStatus;
use crate::utils::current_timestamp_secs;
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Outcome counts of one maturity pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaturityReport {
    pub confirmed: usize,
    pub orphaned: usize,
    pub pending: usize,
    pub pending_orphaned: usize,
    /// Blocks whose status could not be fetched this pass
    pub unknown: usize,
    /// Accepted blocks whose round is still waiting to close
    pub unclosed: usize,
}

/// Submits blocks and follows them to maturity
pub struct BlockTracker {
    chain: Arc<dyn ChainNode>,
    store: Arc<dyn PoolStore>,
    accountant: Arc<Accountant>,
    maturity: u64,
    unclosed: Mutex<Vec<BlockFound>>,
}

impl BlockTracker {
    pub fn new(
        chain: Arc<dyn ChainNode>,
        store: Arc<dyn PoolStore>,
        accountant: Arc<Accountant>,
        maturity: u64,
    ) -> Self {
        Self {
            chain,
            store,
            accountant,
            maturity,
            unclosed: Mutex::new(Vec::new()),
        }
    }

    pub fn maturity(&self) -> u64 {
        self.maturity
    }

    /// Submit a winning share's block and close the round if the node takes it
    ///
    /// Returns `Ok(None)` when the node rejects the block. If the block is
    /// accepted but the round cannot be closed, the close is queued and
    /// retried on the next maturity pass.
    #[instrument(skip_all, fields(height = candidate.job.height, hash = %candidate.hash))]
    pub async fn submit(
        &self,
        candidate: &CandidateBlock,
        finder: &SessionIdentity,
    ) -> Result<Option<RoundClosure>> {
        let accepted = match self.chain.submit_block(&candidate.hex).await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Block submission failed: {}", e);
                return Err(e);
            }
        };
        if !accepted {
            warn!("Node rejected block");
            return Ok(None);
        }

        info!(
            finder = %finder.address,
            worker = %finder.worker_name,
            reward = candidate.job.reward,
            difficulty = candidate.difficulty,
            "Block found"
        );

        let found = BlockFound {
            height: candidate.job.height,
            hash: candidate.hash,
            reward: candidate.job.reward,
            difficulty: candidate.job.difficulty,
            finder: finder.miner,
            worker: finder.worker,
            found_at: current_timestamp_secs(),
        };

        match self.accountant.close_round(found.clone()).await {
            Ok(closure) => Ok(Some(closure)),
            Err(e) => {
                warn!("Round close deferred: {}", e);
                self.unclosed.lock().push(found);
                Ok(None)
            }
        }
    }

    /// Retry round closes that failed earlier, oldest first
    async fn retry_unclosed(&self) -> usize {
        let pending = std::mem::take(&mut *self.unclosed.lock());
        let mut still_open = Vec::new();
        for found in pending {
            if !still_open.is_empty() {
                still_open.push(found);
                continue;
            }
            match self.accountant.close_round(found.clone()).await {
                Ok(_) => info!(height = found.height, "Deferred round closed"),
                Err(e) => {
                    warn!(height = found.height, "Round close still failing: {}", e);
                    still_open.push(found);
                }
            }
        }
        let count = still_open.len();
        if count > 0 {
            let mut unclosed = self.unclosed.lock();
            still_open.append(&mut unclosed);
            *unclosed = still_open;
        }
        count
    }

    /// One pass over every immature block
    ///
    /// `chain_height` is the height of the current tip, when known; a block
    /// the node no longer knows is only declared orphaned once the tip is
    /// past its maturity height.
    pub async fn poll_maturity(&self, chain_height: Option<u64>) -> Result<MaturityReport> {
        let mut report = MaturityReport {
            unclosed: self.retry_unclosed().await,
            ..MaturityReport::default()
        };

        for block in self.store.immature_blocks().await? {
            let status = match self.chain.get_block_header(&block.hash).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(height = block.height, hash = %block.hash, "Confirmation poll failed: {}", e);
                    report.unknown += 1;
                    continue;
                }
            };

            match self.classify(&block, status, chain_height) {
                BlockStatus::Confirmed => {
                    self.store.confirm_block(&block.hash).await?;
                    info!(height = block.height, hash = %block.hash, "Block confirmed");
                    report.confirmed += 1;
                }
                BlockStatus::Orphaned => {
                    self.store.orphan_block(&block.hash).await?;
                    info!(height = block.height, hash = %block.hash, "Block orphaned");
                    report.orphaned += 1;
                }
                status @ BlockStatus::PendingOrphaned => {
                    if block.status != status {
                        self.store.update_block_status(&block.hash, status).await?;
                        warn!(height = block.height, hash = %block.hash, "Block unknown to node");
                    }
                    report.pending_orphaned += 1;
                }
                status @ BlockStatus::Pending => {
                    if block.status != status {
                        self.store.update_block_status(&block.hash, status).await?;
                    }
                    report.pending += 1;
                }
            }
        }

        Ok(report)
    }

    fn classify(
        &self,
        block: &BlockRecord,
        status: HeaderStatus,
        chain_height: Option<u64>,
    ) -> BlockStatus {
        match status {
            HeaderStatus::Confirmations(depth) if depth < 0 => BlockStatus::Orphaned,
            HeaderStatus::Confirmations(depth) if depth as u64 >= self.maturity => {
                BlockStatus::Confirmed
            }
            HeaderStatus::Confirmations(_) => BlockStatus::Pending,
            HeaderStatus::NotFound => {
                let matured_height = block.height.saturating_add(self.maturity);
                match chain_height {
                    Some(tip) if tip >= matured_height => BlockStatus::Orphaned,
                    _ => BlockStatus::PendingOrphaned,
                }
            }
        }
    }
}
