//! Per-connection protocol state
//!
//! A [`Session`] is shared between the connection's reader task, the
//! server's broadcast path and the periodic stats/vardiff pass. Every
//! mutable field sits behind one short-held lock.

use crate::share::ShareOutcome;
use crate::types::{MinerAddress, MinerId, SessionId, WorkerId};
use crate::vardiff::VardiffConfig;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Identity bound to a session by `mining.authorize`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub miner: MinerId,
    pub worker: WorkerId,
    pub address: MinerAddress,
    pub worker_name: String,
}

/// Share counters drained by the stats loop
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ShareStats {
    pub accepted: u64,
    pub rejected: u64,
    /// Credited effort of accepted shares
    pub effort: f64,
}

/// Bounded set of recently seen share fingerprints
#[derive(Debug)]
pub struct DuplicateSet {
    seen: HashSet<u64>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl DuplicateSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `false` when the fingerprint was already present
    pub fn insert(&mut self, fingerprint: u64) -> bool {
        if !self.seen.insert(fingerprint) {
            return false;
        }
        self.order.push_back(fingerprint);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug)]
struct SessionState {
    subscribed: bool,
    identity: Option<SessionIdentity>,
    difficulty: f64,
    pending_difficulty: Option<f64>,
    shares_since_retarget: u32,
    last_retarget: u64,
    stats: ShareStats,
    duplicates: DuplicateSet,
}

/// One miner connection
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    extranonce1: Vec<u8>,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        extranonce1: Vec<u8>,
        difficulty: f64,
        duplicate_capacity: usize,
        outbound: mpsc::Sender<String>,
        now: u64,
    ) -> Self {
        Self {
            id,
            peer,
            extranonce1,
            outbound,
            closed: CancellationToken::new(),
            state: Mutex::new(SessionState {
                subscribed: false,
                identity: None,
                difficulty,
                pending_difficulty: None,
                shares_since_retarget: 0,
                last_retarget: now,
                stats: ShareStats::default(),
                duplicates: DuplicateSet::new(duplicate_capacity),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn extranonce1(&self) -> &[u8] {
        &self.extranonce1
    }

    /// Returns `false` if the session was already subscribed
    pub fn subscribe(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.subscribed, true)
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().subscribed
    }

    /// Returns `false` if the session was already authorized
    pub fn authorize(&self, identity: SessionIdentity) -> bool {
        let mut state = self.state.lock();
        if state.identity.is_some() {
            return false;
        }
        state.identity = Some(identity);
        true
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        self.state.lock().identity.clone()
    }

    pub fn is_authorized(&self) -> bool {
        self.state.lock().identity.is_some()
    }

    /// Subscribed and authorized, so jobs may be pushed
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.subscribed && state.identity.is_some()
    }

    pub fn difficulty(&self) -> f64 {
        self.state.lock().difficulty
    }

    pub fn pending_difficulty(&self) -> Option<f64> {
        self.state.lock().pending_difficulty
    }

    /// Replace the active difficulty right away
    ///
    /// Only valid before the miner has received any work.
    pub fn set_difficulty(&self, difficulty: f64) {
        let mut state = self.state.lock();
        state.difficulty = difficulty;
        state.pending_difficulty = None;
    }

    pub fn set_pending_difficulty(&self, difficulty: f64) {
        self.state.lock().pending_difficulty = Some(difficulty);
    }

    /// Promote the pending difficulty, returning it if there was one
    pub fn activate_pending_difficulty(&self) -> Option<f64> {
        let mut state = self.state.lock();
        let pending = state.pending_difficulty.take()?;
        state.difficulty = pending;
        Some(pending)
    }

    /// Record a share fingerprint; `false` means it was seen before
    pub fn remember_share(&self, fingerprint: u64) -> bool {
        self.state.lock().duplicates.insert(fingerprint)
    }

    pub fn clear_duplicates(&self) {
        self.state.lock().duplicates.clear();
    }

    /// Count a classified share
    pub fn record_outcome(&self, outcome: ShareOutcome, effort: f64) {
        let mut state = self.state.lock();
        if outcome.is_accepted() {
            state.stats.accepted += 1;
            state.stats.effort += effort;
            state.shares_since_retarget = state.shares_since_retarget.saturating_add(1);
        } else {
            state.stats.rejected += 1;
        }
    }

    /// Count a submission that never reached classification
    pub fn record_rejected(&self) {
        self.state.lock().stats.rejected += 1;
    }

    /// Take the counters accumulated since the last call
    pub fn drain_stats(&self) -> ShareStats {
        std::mem::take(&mut self.state.lock().stats)
    }

    /// Run one vardiff check
    ///
    /// A proposal becomes the pending difficulty and restarts the share
    /// count; it is returned so the caller can log it.
    pub fn retarget(&self, vardiff: &VardiffConfig, now: u64) -> Option<f64> {
        let mut state = self.state.lock();
        if state.identity.is_none() {
            return None;
        }
        let elapsed = Duration::from_secs(now.saturating_sub(state.last_retarget));
        let candidate = vardiff.retarget(state.difficulty, state.shares_since_retarget, elapsed)?;
        state.pending_difficulty = Some(candidate);
        state.shares_since_retarget = 0;
        state.last_retarget = now;
        Some(candidate)
    }

    /// Queue one line for the writer task
    ///
    /// A peer that cannot keep up with its queue is disconnected.
    pub fn send(&self, line: String) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        match self.outbound.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %self.id, peer = %self.peer, "Outbound queue full, closing");
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                false
            }
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the session closes
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}
