//! Pool orchestration
//!
//! Wires the components together and runs the long-lived tasks: Stratum
//! reactor, template refresh, stats, maturity and the control channel.

use crate::block::BlockTracker;
use crate::chain::ChainNode;
use crate::config::Config;
use crate::control;
use crate::crypto::HashFunction;
use crate::job::{Job, JobBuilder, JobBuilderConfig, JobManager};
use crate::round::Accountant;
use crate::share::ShareValidator;
use crate::stats::StatsLoop;
use crate::store::{MetricsStore, PoolStore};
use crate::stratum::{Reactor, ServerContext, SessionFactory, StratumServer};
use crate::utils::current_timestamp_secs;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A fully wired pool
pub struct Pool {
    config: Config,
    chain: Arc<dyn ChainNode>,
    metrics: Arc<dyn MetricsStore>,
    jobs: Arc<JobManager>,
    accountant: Arc<Accountant>,
    blocks: Arc<BlockTracker>,
    server: Arc<StratumServer>,
    refresh: Arc<Notify>,
}

impl Pool {
    /// Build every component from `config`
    ///
    /// Resolves the payout script through the node and restores any
    /// persisted round progress.
    pub async fn new<S>(
        config: Config,
        chain: Arc<dyn ChainNode>,
        store: Arc<S>,
        hasher: Arc<dyn HashFunction>,
    ) -> Result<Self>
    where
        S: PoolStore + MetricsStore + 'static,
    {
        config.validate()?;
        let family = config.coin_family;
        let payout_script = resolve_payout_script(chain.as_ref(), config.payout_address()?).await?;

        let builder = JobBuilder::new(JobBuilderConfig {
            family,
            pool_tag: config.pool_tag.clone(),
            payout_script,
            max_block_bytes: config.max_block_bytes,
            coinbase_reserve_bytes: config.coinbase_reserve_bytes,
        })?;
        let jobs = Arc::new(JobManager::new(builder, config.max_live_jobs));

        let pool_store: Arc<dyn PoolStore> = store.clone();
        let accountant = Arc::new(Accountant::new(
            config.reward_scheme,
            config.pool_fee,
            config.pplns_window,
            pool_store.clone(),
        )?);
        if let Some(snapshot) = pool_store.load_round_progress(config.reward_scheme).await? {
            info!(
                round = snapshot.block_number,
                effort = snapshot.total_effort,
                "Restored round progress"
            );
            accountant.restore(&snapshot);
        }

        let blocks = Arc::new(BlockTracker::new(
            chain.clone(),
            pool_store.clone(),
            accountant.clone(),
            config.maturity_depth,
        ));

        let validator = ShareValidator::new(
            hasher,
            config.max_future_skew_duration()?,
            config.low_difficulty_tolerance,
        );
        let server = Arc::new(StratumServer::new(
            SessionFactory::new(config.initial_difficulty, config.duplicate_capacity),
            ServerContext {
                jobs: jobs.clone(),
                validator,
                accountant: accountant.clone(),
                blocks: blocks.clone(),
                chain: chain.clone(),
                store: pool_store,
                vardiff: config.vardiff()?,
            },
        ));

        info!(
            family = %family,
            scheme = %config.reward_scheme,
            fee = config.pool_fee,
            "Pool initialized"
        );

        Ok(Self {
            config,
            chain,
            metrics: store,
            jobs,
            accountant,
            blocks,
            server,
            refresh: Arc::new(Notify::new()),
        })
    }

    pub fn server(&self) -> &Arc<StratumServer> {
        &self.server
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn accountant(&self) -> &Arc<Accountant> {
        &self.accountant
    }

    pub fn blocks(&self) -> &Arc<BlockTracker> {
        &self.blocks
    }

    /// Handle that triggers an immediate template refresh
    pub fn refresh_handle(&self) -> Arc<Notify> {
        self.refresh.clone()
    }

    /// Fetch a template and broadcast the job it yields, if any
    pub async fn refresh_template(&self) -> Result<Option<Arc<Job>>> {
        let template = self.chain.get_block_template().await?;
        let job = self.jobs.process_template(template, current_timestamp_secs())?;
        if let Some(job) = &job {
            self.server.broadcast_job(job);
        }
        Ok(job)
    }

    /// Bind the configured listeners and serve until shutdown or Ctrl-C
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let stratum = TcpListener::bind(self.config.stratum_socket_addr()?).await?;
        let control = TcpListener::bind(self.config.control_socket_addr()?).await?;

        let signal = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal.cancelled() => {}
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => {
                        info!("Interrupt received, shutting down");
                        signal.cancel();
                    }
                    Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
                },
            }
        });

        self.serve(stratum, control, shutdown).await
    }

    /// Serve on already bound listeners until `shutdown` fires
    pub async fn serve(
        self: Arc<Self>,
        stratum: TcpListener,
        control: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if let Err(e) = self.refresh_template().await {
            warn!("Initial template fetch failed: {}", e);
        }

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let reactor = Reactor::new(self.config.reactor()?);
        let server = self.server.clone();
        let token = shutdown.clone();
        tasks.push((
            "stratum",
            tokio::spawn(async move {
                if let Err(e) = reactor.run(stratum, server, token.clone()).await {
                    error!("Stratum reactor failed: {}", e);
                    token.cancel();
                }
            }),
        ));

        let pool = self.clone();
        let token = shutdown.clone();
        let every = self.config.template_refresh_duration()?;
        tasks.push(("template", tokio::spawn(pool.template_loop(every, token))));

        let stats = StatsLoop::new(
            self.server.clone(),
            self.accountant.clone(),
            self.metrics.clone(),
            self.config.stats_interval_duration()?,
            self.config.retarget_interval_duration()?,
        );
        tasks.push(("stats", tokio::spawn(stats.run(shutdown.clone()))));

        let pool = self.clone();
        let every = self.config.maturity_interval_duration()?;
        tasks.push(("maturity", tokio::spawn(pool.maturity_loop(every, shutdown.clone()))));

        let refresh = self.refresh.clone();
        let token = shutdown.clone();
        tasks.push((
            "control",
            tokio::spawn(async move {
                if let Err(e) = control::run(control, refresh, token).await {
                    error!("Control channel failed: {}", e);
                }
            }),
        ));

        shutdown.cancelled().await;
        info!("Shutting down");
        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!(task = name, "Task panicked: {}", e);
            }
        }
        Ok(())
    }

    async fn template_loop(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
                _ = self.refresh.notified() => {
                    info!("Block notify, refreshing template");
                    tick.reset();
                }
            }
            if let Err(e) = self.refresh_template().await {
                warn!("Template refresh failed: {}", e);
            }
        }
    }

    async fn maturity_loop(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            // Templates build on the tip, one below their height
            let tip = self.jobs.latest().map(|job| job.height.saturating_sub(1));
            match self.blocks.poll_maturity(tip).await {
                Ok(report) if report != Default::default() => info!(
                    confirmed = report.confirmed,
                    orphaned = report.orphaned,
                    pending = report.pending,
                    pending_orphaned = report.pending_orphaned,
                    unknown = report.unknown,
                    unclosed = report.unclosed,
                    "Maturity pass"
                ),
                Ok(_) => {}
                Err(e) => warn!("Maturity pass failed: {}", e),
            }
        }
    }
}

/// Script the coinbase pays, as reported by the node
async fn resolve_payout_script(chain: &dyn ChainNode, address: &str) -> Result<Vec<u8>> {
    let info = chain.validate_address(address).await?;
    if !info.is_valid {
        return Err(Error::config(format!("Payout address {} is not valid", address)));
    }
    let script = info
        .script_pub_key
        .ok_or_else(|| Error::config(format!("Node returned no script for {}", address)))?;
    hex::decode(&script).map_err(|e| Error::config(format!("Invalid payout script: {}", e)))
}
