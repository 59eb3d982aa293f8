//! Stratum server: request dispatch and job broadcast
//!
//! Implements [`ConnectionHandler`] for the reactor. Owns the live session
//! table and glues sessions to the job manager, share validator, round
//! accountant and block tracker.

use super::extranonce::SessionFactory;
use super::protocol::{codes, StratumMethod, StratumNotification, StratumRequest, StratumResponse};
use super::reactor::ConnectionHandler;
use super::session::{Session, SessionIdentity, ShareStats};
use crate::block::BlockTracker;
use crate::chain::ChainNode;
use crate::job::{CoinFamily, Job, JobManager};
use crate::round::Accountant;
use crate::share::{ShareOutcome, ShareValidator};
use crate::store::PoolStore;
use crate::types::{Credentials, MinerAddress, SessionId};
use crate::utils::current_timestamp_secs;
use crate::vardiff::VardiffConfig;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Collaborators the server dispatches into
pub struct ServerContext {
    pub jobs: Arc<JobManager>,
    pub validator: ShareValidator,
    pub accountant: Arc<Accountant>,
    pub blocks: Arc<BlockTracker>,
    pub chain: Arc<dyn ChainNode>,
    pub store: Arc<dyn PoolStore>,
    pub vardiff: VardiffConfig,
}

/// Dispatches Stratum requests for every live session
pub struct StratumServer {
    family: CoinFamily,
    sessions: DashMap<SessionId, Arc<Session>>,
    factory: SessionFactory,
    ctx: ServerContext,
    /// `validateaddress` results by address
    addresses: Mutex<HashMap<MinerAddress, bool>>,
    /// Counters of sessions that disconnected since the last drain
    retired: Mutex<Vec<(SessionIdentity, ShareStats)>>,
}

impl StratumServer {
    pub fn new(factory: SessionFactory, ctx: ServerContext) -> Self {
        Self {
            family: ctx.jobs.family(),
            sessions: DashMap::new(),
            factory,
            ctx,
            addresses: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn family(&self) -> CoinFamily {
        self.family
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of live sessions; no map guard is held afterwards
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Push a newly published job to every ready session
    ///
    /// Pending difficulties are activated here so a miner only ever sees a
    /// difficulty change together with fresh work.
    pub fn broadcast_job(&self, job: &Job) -> usize {
        let mut delivered = 0;
        for session in self.sessions() {
            if !session.is_ready() {
                continue;
            }
            if job.clean {
                session.clear_duplicates();
            }
            if let Some(difficulty) = session.activate_pending_difficulty() {
                debug!(session = %session.id(), difficulty, "Activating difficulty");
                if !self.send_difficulty(&session, difficulty) {
                    continue;
                }
            }
            if session.send(job.notify_line.clone()) {
                delivered += 1;
            }
        }
        info!(
            job = %job.id,
            height = job.height,
            clean = job.clean,
            sessions = delivered,
            "Broadcast job"
        );
        delivered
    }

    /// Drain share counters of every authorized session, live or departed
    pub fn drain_stats(&self) -> Vec<(SessionIdentity, ShareStats)> {
        let mut drained = std::mem::take(&mut *self.retired.lock());
        for session in self.sessions() {
            if let Some(identity) = session.identity() {
                drained.push((identity, session.drain_stats()));
            }
        }
        drained
    }

    /// Return drained counters that could not be recorded
    ///
    /// They are handed out again, ahead of newer counters, on the next drain.
    pub fn requeue_stats(&self, stats: Vec<(SessionIdentity, ShareStats)>) {
        let mut retired = self.retired.lock();
        let newer = std::mem::replace(&mut *retired, stats);
        retired.extend(newer);
    }

    /// Run the vardiff check on every session, returning how many changed
    pub fn retarget_sessions(&self, now: u64) -> usize {
        let mut changed = 0;
        for session in self.sessions() {
            let before = session.difficulty();
            if let Some(next) = session.retarget(&self.ctx.vardiff, now) {
                debug!(session = %session.id(), from = before, to = next, "Retarget pending");
                changed += 1;
            }
        }
        changed
    }

    fn send_difficulty(&self, session: &Session, difficulty: f64) -> bool {
        let (method, params) = self.family.difficulty_message(difficulty);
        match StratumNotification::new(method, params).to_line() {
            Ok(line) => session.send(line),
            Err(e) => {
                error!("Failed to encode difficulty: {}", e);
                false
            }
        }
    }

    fn reply(&self, session: &Session, response: StratumResponse) {
        match response.to_line() {
            Ok(line) => {
                session.send(line);
            }
            Err(e) => error!("Failed to encode response: {}", e),
        }
    }

    /// Difficulty then latest job, once a session becomes ready
    fn start_work(&self, session: &Session) {
        if !session.is_ready() {
            return;
        }
        session.activate_pending_difficulty();
        if !self.send_difficulty(session, session.difficulty()) {
            return;
        }
        if let Some(job) = self.ctx.jobs.latest() {
            session.send(job.notify_line.clone());
        }
    }

    fn handle_subscribe(&self, session: &Session, id: Value) -> StratumResponse {
        if !session.subscribe() {
            return StratumResponse::error(id, codes::OTHER, "Already subscribed");
        }
        let subscription_id = session.id().to_string();
        StratumResponse::success(
            id,
            self.family.subscribe_result(&subscription_id, session.extranonce1()),
        )
    }

    async fn address_is_valid(&self, address: &MinerAddress) -> Result<bool> {
        if let Some(valid) = self.addresses.lock().get(address).copied() {
            return Ok(valid);
        }
        let info = self.ctx.chain.validate_address(address.as_str()).await?;
        self.addresses.lock().insert(address.clone(), info.is_valid);
        Ok(info.is_valid)
    }

    async fn handle_authorize(&self, session: &Session, request: &StratumRequest) -> StratumResponse {
        let id = request.id.clone();
        if session.is_authorized() {
            return StratumResponse::error(id, codes::OTHER, "Already authorized");
        }
        let credentials = match request.str_param(0).and_then(Credentials::from_username) {
            Ok(credentials) => credentials,
            Err(e) => {
                debug!(peer = %session.peer(), "Bad credentials: {}", e);
                return StratumResponse::error(id, codes::UNAUTHORIZED, "Unauthorized worker");
            }
        };

        match self.address_is_valid(&credentials.address).await {
            Ok(true) => {}
            Ok(false) => {
                info!(address = %credentials.address, "Rejected invalid address");
                return StratumResponse::error(id, codes::UNAUTHORIZED, "Invalid address");
            }
            Err(e) => {
                warn!(address = %credentials.address, "Address validation failed: {}", e);
                return StratumResponse::error(id, codes::OTHER, "Address validation unavailable");
            }
        }

        let identity = match self.register(&credentials).await {
            Ok(identity) => identity,
            Err(e) => {
                error!(worker = %credentials, "Failed to register worker: {}", e);
                return StratumResponse::error(id, codes::OTHER, "Internal error");
            }
        };

        if !session.authorize(identity) {
            return StratumResponse::error(id, codes::OTHER, "Already authorized");
        }
        info!(session = %session.id(), peer = %session.peer(), worker = %credentials, "Authorized");
        StratumResponse::success(id, Value::Bool(true))
    }

    async fn register(&self, credentials: &Credentials) -> Result<SessionIdentity> {
        let miner = self.ctx.store.add_miner(&credentials.address).await?;
        let worker = self.ctx.store.add_worker(miner, &credentials.worker).await?;
        Ok(SessionIdentity {
            miner,
            worker,
            address: credentials.address.clone(),
            worker_name: credentials.worker.clone(),
        })
    }

    fn handle_submit(&self, session: &Session, request: &StratumRequest) -> StratumResponse {
        let id = request.id.clone();
        if !session.is_subscribed() {
            return StratumResponse::error(id, codes::NOT_SUBSCRIBED, "Not subscribed");
        }
        let identity = match session.identity() {
            Some(identity) => identity,
            None => return StratumResponse::error(id, codes::UNAUTHORIZED, "Unauthorized worker"),
        };

        let share = match self.family.parse_submit(&request.params) {
            Ok(share) => share,
            Err(e) => {
                debug!(session = %session.id(), "Malformed submit: {}", e);
                session.record_rejected();
                return StratumResponse::error(id, codes::OTHER, "Malformed share");
            }
        };

        let now = current_timestamp_secs();
        let validated = match self.ctx.validator.validate(session, &self.ctx.jobs, &share, now) {
            Ok(validated) => validated,
            Err(e) => {
                debug!(session = %session.id(), job = %share.job_id, "Invalid share: {}", e);
                session.record_rejected();
                return StratumResponse::error(id, codes::OTHER, "Invalid share");
            }
        };

        session.record_outcome(validated.outcome, validated.effort);
        if validated.outcome.is_accepted() {
            self.ctx.accountant.credit(identity.miner, validated.effort);
        }
        debug!(
            session = %session.id(),
            job = %share.job_id,
            outcome = validated.outcome.as_str(),
            difficulty = validated.share_difficulty,
            "Share"
        );

        if let Some(candidate) = validated.block {
            let blocks = self.ctx.blocks.clone();
            tokio::spawn(async move {
                if let Err(e) = blocks.submit(&candidate, &identity).await {
                    error!(height = candidate.job.height, "Block submission error: {}", e);
                }
            });
        }

        match validated.outcome {
            ShareOutcome::ValidShare | ShareOutcome::ValidBlock => {
                StratumResponse::success(id, Value::Bool(true))
            }
            ShareOutcome::Duplicate => {
                StratumResponse::error(id, codes::DUPLICATE_SHARE, "Duplicate share")
            }
            ShareOutcome::StaleJob => StratumResponse::error(id, codes::JOB_NOT_FOUND, "Job not found"),
            ShareOutcome::LowDifficulty => {
                StratumResponse::error(id, codes::LOW_DIFFICULTY, "Low difficulty share")
            }
            ShareOutcome::Unauthorized => {
                StratumResponse::error(id, codes::UNAUTHORIZED, "Unauthorized worker")
            }
            ShareOutcome::BadTime => StratumResponse::error(id, codes::OTHER, "Time out of range"),
        }
    }

    /// A miner's difficulty hint, bounded by the vardiff limits
    ///
    /// Before work has been sent it applies immediately; afterwards it waits
    /// for the next job like any other change.
    fn handle_suggest_difficulty(&self, session: &Session, request: &StratumRequest) -> StratumResponse {
        let id = request.id.clone();
        let suggested = match request.params.first().and_then(Value::as_f64) {
            Some(d) if d.is_finite() && d > 0.0 => d,
            _ => return StratumResponse::error(id, codes::OTHER, "Invalid difficulty"),
        };
        let difficulty = self.ctx.vardiff.bound(suggested);
        if session.is_ready() {
            session.set_pending_difficulty(difficulty);
        } else {
            session.set_difficulty(difficulty);
        }
        StratumResponse::success(id, Value::Bool(true))
    }
}

#[async_trait]
impl ConnectionHandler for StratumServer {
    fn on_connect(&self, peer: SocketAddr, outbound: mpsc::Sender<String>) -> Result<Arc<Session>> {
        let session = Arc::new(self.factory.create(peer, outbound, current_timestamp_secs()));
        self.sessions.insert(session.id(), session.clone());
        Ok(session)
    }

    async fn on_line(&self, session: &Arc<Session>, line: &str) {
        let request = match StratumRequest::parse(line) {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = %session.peer(), "Malformed request: {}", e);
                self.reply(session, StratumResponse::error(Value::Null, codes::OTHER, "Malformed request"));
                return;
            }
        };

        let method = request.method_enum();
        match method {
            StratumMethod::Subscribe => {
                let response = self.handle_subscribe(session, request.id.clone());
                let ok = response.error.is_none();
                self.reply(session, response);
                if ok {
                    self.start_work(session);
                }
            }
            StratumMethod::Authorize => {
                let response = self.handle_authorize(session, &request).await;
                let ok = response.error.is_none();
                self.reply(session, response);
                if ok {
                    self.start_work(session);
                }
            }
            StratumMethod::Submit => {
                let response = self.handle_submit(session, &request);
                self.reply(session, response);
            }
            StratumMethod::ExtranonceSubscribe => {
                self.reply(session, StratumResponse::success(request.id, json!(true)));
            }
            StratumMethod::SuggestDifficulty => {
                let response = self.handle_suggest_difficulty(session, &request);
                self.reply(session, response);
            }
            _ => {
                debug!(peer = %session.peer(), method = %request.method, "Unsupported method");
                self.reply(
                    session,
                    StratumResponse::error(request.id, codes::OTHER, "Unsupported method"),
                );
            }
        }
    }

    fn on_disconnect(&self, session: &Arc<Session>) {
        self.sessions.remove(&session.id());
        if let Some(identity) = session.identity() {
            let stats = session.drain_stats();
            if stats != ShareStats::default() {
                self.retired.lock().push((identity, stats));
            }
        }
        debug!(session = %session.id(), peer = %session.peer(), "Session released");
    }
}
