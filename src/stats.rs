//! Periodic statistics and vardiff loop
//!
//! Every stats interval the share counters of all sessions are drained into
//! hashrate samples per worker, per miner and for the pool, and the open
//! round is flushed to the store. The vardiff pass runs from the same loop
//! on its own interval.

use crate::round::Accountant;
use crate::store::{MetricPoint, MetricsStore};
use crate::stratum::{SessionIdentity, ShareStats, StratumServer};
use crate::types::{HashRate, MinerAddress, WorkerId};
use crate::utils::current_timestamp_secs;
use crate::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one stats pass recorded
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsReport {
    pub workers: usize,
    pub miners: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub pool_hashrate: HashRate,
}

/// Aggregate drained counters into metric points
///
/// Workers are keyed by their worker id, miners by address.
pub fn aggregate(
    drained: &[(SessionIdentity, ShareStats)],
    hashes_per_difficulty: f64,
    seconds: f64,
    timestamp: u64,
) -> (Vec<MetricPoint>, StatsReport) {
    let mut workers: BTreeMap<(MinerAddress, WorkerId), ShareStats> = BTreeMap::new();
    let mut miners: BTreeMap<MinerAddress, f64> = BTreeMap::new();
    let mut report = StatsReport::default();
    let mut pool_effort = 0.0;

    for (identity, stats) in drained {
        let worker = workers
            .entry((identity.address.clone(), identity.worker))
            .or_default();
        worker.accepted += stats.accepted;
        worker.rejected += stats.rejected;
        worker.effort += stats.effort;
        *miners.entry(identity.address.clone()).or_insert(0.0) += stats.effort;
        report.accepted += stats.accepted;
        report.rejected += stats.rejected;
        pool_effort += stats.effort;
    }

    let mut points = Vec::with_capacity(workers.len() * 3 + miners.len() + 1);
    for ((address, worker), stats) in &workers {
        let rate = HashRate::from_effort(stats.effort, hashes_per_difficulty, seconds);
        points.push(
            MetricPoint::new("hashrate", timestamp, rate.value())
                .label("address", address)
                .label("worker", worker),
        );
        points.push(
            MetricPoint::new("shares_accepted", timestamp, stats.accepted as f64)
                .label("address", address)
                .label("worker", worker),
        );
        points.push(
            MetricPoint::new("shares_rejected", timestamp, stats.rejected as f64)
                .label("address", address)
                .label("worker", worker),
        );
    }
    for (address, effort) in &miners {
        let rate = HashRate::from_effort(*effort, hashes_per_difficulty, seconds);
        points.push(MetricPoint::new("hashrate", timestamp, rate.value()).label("address", address));
    }

    report.workers = workers.len();
    report.miners = miners.len();
    report.pool_hashrate = HashRate::from_effort(pool_effort, hashes_per_difficulty, seconds);
    points.push(MetricPoint::new("pool_hashrate", timestamp, report.pool_hashrate.value()));

    (points, report)
}

/// Drives the stats and vardiff passes
pub struct StatsLoop {
    server: Arc<StratumServer>,
    accountant: Arc<Accountant>,
    metrics: Arc<dyn MetricsStore>,
    stats_interval: Duration,
    retarget_interval: Duration,
    /// Seconds covered by counters requeued after a failed append
    carried: Mutex<f64>,
}

impl StatsLoop {
    pub fn new(
        server: Arc<StratumServer>,
        accountant: Arc<Accountant>,
        metrics: Arc<dyn MetricsStore>,
        stats_interval: Duration,
        retarget_interval: Duration,
    ) -> Self {
        Self {
            server,
            accountant,
            metrics,
            stats_interval,
            retarget_interval,
            carried: Mutex::new(0.0),
        }
    }

    /// One stats pass covering `seconds` of activity
    ///
    /// If the samples cannot be appended the drained counters go back to the
    /// server and the next pass covers both spans.
    pub async fn sample(&self, seconds: f64) -> Result<StatsReport> {
        let drained = self.server.drain_stats();
        let span = seconds + std::mem::take(&mut *self.carried.lock());
        let (points, report) = aggregate(
            &drained,
            self.server.family().hashes_per_difficulty(),
            span,
            current_timestamp_secs(),
        );
        if let Err(e) = self.metrics.append(&points).await {
            warn!(
                counters = drained.len(),
                "Hashrate samples not stored, keeping counters for the next pass"
            );
            self.server.requeue_stats(drained);
            *self.carried.lock() = span;
            return Err(e);
        }
        self.accountant.flush().await?;
        Ok(report)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut stats_tick = interval(self.stats_interval);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retarget_tick = interval(self.retarget_interval);
        retarget_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Both intervals fire immediately; skip that first tick
        stats_tick.tick().await;
        retarget_tick.tick().await;

        let seconds = self.stats_interval.as_secs_f64();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = stats_tick.tick() => match self.sample(seconds).await {
                    Ok(report) => info!(
                        workers = report.workers,
                        miners = report.miners,
                        accepted = report.accepted,
                        rejected = report.rejected,
                        "Pool hashrate {}",
                        report.pool_hashrate
                    ),
                    Err(e) => warn!("Stats pass failed: {}", e),
                },
                _ = retarget_tick.tick() => {
                    let changed = self.server.retarget_sessions(current_timestamp_secs());
                    if changed > 0 {
                        debug!(sessions = changed, "Difficulty retargets pending");
                    }
                }
            }
        }

        if let Err(e) = self.accountant.flush().await {
            warn!("Final round flush failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockTracker;
    use crate::chain::{AddressInfo, BlockTemplate, ChainNode, HeaderStatus};
    use crate::crypto::{Hash256, Sha256d};
    use crate::job::test_support::builder;
    use crate::job::{CoinFamily, JobManager};
    use crate::round::RewardScheme;
    use crate::share::{ShareOutcome, ShareValidator};
    use crate::store::MemoryStore;
    use crate::stratum::{ConnectionHandler, ServerContext, SessionFactory};
    use crate::types::MinerId;
    use crate::vardiff::VardiffConfig;
    use crate::Error;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    fn identity(address: &str, worker: i64) -> SessionIdentity {
        SessionIdentity {
            miner: MinerId(1),
            worker: WorkerId(worker),
            address: MinerAddress(address.into()),
            worker_name: format!("w{}", worker),
        }
    }

    fn stats(accepted: u64, rejected: u64, effort: f64) -> ShareStats {
        ShareStats {
            accepted,
            rejected,
            effort,
        }
    }

    #[test]
    fn test_aggregate_per_worker_and_miner() {
        let drained = vec![
            (identity("alice", 1), stats(3, 1, 30.0)),
            // Second connection of the same worker
            (identity("alice", 1), stats(1, 0, 10.0)),
            (identity("alice", 2), stats(2, 0, 20.0)),
            (identity("bob", 3), stats(0, 2, 0.0)),
        ];
        let (points, report) = aggregate(&drained, 4.0, 10.0, 1000);

        assert_eq!(report.workers, 3);
        assert_eq!(report.miners, 2);
        assert_eq!(report.accepted, 6);
        assert_eq!(report.rejected, 3);
        assert_eq!(report.pool_hashrate.value(), 24.0);

        let find = |key: &str| {
            points
                .iter()
                .find(|p| p.series_key() == key)
                .map(|p| p.value)
                .unwrap()
        };
        assert_eq!(find("hashrate:address=alice:worker=1"), 16.0);
        assert_eq!(find("hashrate:address=alice"), 24.0);
        assert_eq!(find("hashrate:address=bob"), 0.0);
        assert_eq!(find("shares_rejected:address=bob:worker=3"), 2.0);
        assert_eq!(find("pool_hashrate"), 24.0);
        assert!(points.iter().all(|p| p.timestamp == 1000));
    }

    struct Offline;

    #[async_trait]
    impl ChainNode for Offline {
        async fn get_block_template(&self) -> Result<BlockTemplate> {
            Err(Error::network("offline"))
        }
        async fn submit_block(&self, _block_hex: &str) -> Result<bool> {
            Ok(false)
        }
        async fn get_block_header(&self, _hash: &Hash256) -> Result<HeaderStatus> {
            Ok(HeaderStatus::NotFound)
        }
        async fn validate_address(&self, _address: &str) -> Result<AddressInfo> {
            Ok(AddressInfo {
                is_valid: true,
                script_pub_key: None,
            })
        }
    }

    /// Metrics store that refuses appends while `failing` is set
    #[derive(Default)]
    struct FlakyMetrics {
        failing: AtomicBool,
        appended: Mutex<Vec<MetricPoint>>,
    }

    #[async_trait]
    impl MetricsStore for FlakyMetrics {
        async fn append(&self, points: &[MetricPoint]) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::store("metrics backend unavailable"));
            }
            self.appended.lock().extend_from_slice(points);
            Ok(())
        }
    }

    fn stats_loop(metrics: Arc<FlakyMetrics>) -> (StatsLoop, Arc<StratumServer>) {
        let chain = Arc::new(Offline);
        let store = Arc::new(MemoryStore::default());
        let jobs = Arc::new(JobManager::new(builder(CoinFamily::Bitcoin), 4));
        let accountant =
            Arc::new(Accountant::new(RewardScheme::Prop, 0.0, 0.0, store.clone()).unwrap());
        let blocks = Arc::new(BlockTracker::new(
            chain.clone(),
            store.clone(),
            accountant.clone(),
            100,
        ));
        let ctx = ServerContext {
            jobs,
            validator: ShareValidator::new(Arc::new(Sha256d), Duration::from_secs(7200), 0.01),
            accountant: accountant.clone(),
            blocks,
            chain,
            store,
            vardiff: VardiffConfig::default(),
        };
        let server = Arc::new(StratumServer::new(SessionFactory::starting_at(1, 8.0, 16), ctx));
        let stats = StatsLoop::new(
            server.clone(),
            accountant,
            metrics,
            Duration::from_secs(10),
            Duration::from_secs(90),
        );
        (stats, server)
    }

    #[tokio::test]
    async fn test_failed_append_keeps_counters() {
        let metrics = Arc::new(FlakyMetrics::default());
        let (stats, server) = stats_loop(metrics.clone());

        let (tx, _rx) = mpsc::channel(8);
        let session = server.on_connect("127.0.0.1:5000".parse().unwrap(), tx).unwrap();
        session.subscribe();
        session.authorize(identity("alice", 1));
        session.record_outcome(ShareOutcome::ValidShare, 40.0);

        metrics.failing.store(true, Ordering::SeqCst);
        assert!(stats.sample(10.0).await.is_err());
        assert!(metrics.appended.lock().is_empty());

        session.record_outcome(ShareOutcome::ValidShare, 40.0);
        metrics.failing.store(false, Ordering::SeqCst);
        let report = stats.sample(10.0).await.unwrap();

        // Both passes' shares land in one sample spanning both intervals
        assert_eq!(report.accepted, 2);
        let hps = CoinFamily::Bitcoin.hashes_per_difficulty();
        assert_eq!(report.pool_hashrate.value(), 80.0 * hps / 20.0);
        assert!(metrics
            .appended
            .lock()
            .iter()
            .any(|p| p.series_key() == "pool_hashrate"));
    }

    #[test]
    fn test_aggregate_empty() {
        let (points, report) = aggregate(&[], 4.0, 10.0, 0);
        assert_eq!(points.len(), 1);
        assert_eq!(report, StatsReport::default());
    }
}
