//! Commit acknowledgment tracking
//!
//! The feeder side registers every commit whose durability policy needs
//! acknowledgments from consumers. Acks arrive on the session input threads
//! in any order; each pending transaction counts each qualifying node once.
//!
//! Completion is either synchronous (the committing thread blocks in
//! [`AckTracker::await_acks`]) or asynchronous (a callback fires exactly
//! once, from whichever of the ack path, the expiry sweep or shutdown gets
//! there first).

use crate::vlsn::Vlsn;
use crate::{Error, Result, TxnId};
use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Id of the null transaction, which gets a dedicated slot
pub const NULL_TXN_ID: TxnId = 0;

/// Which nodes currently count toward a quorum
pub trait AckPolicy: Send + Sync {
    /// Whether an ack from `node` is counted
    fn counts_toward_quorum(&self, node: &str) -> bool;
}

/// Every node counts
#[derive(Debug, Clone, Copy, Default)]
pub struct AllNodes;

impl AckPolicy for AllNodes {
    fn counts_toward_quorum(&self, _node: &str) -> bool {
        true
    }
}

impl<F> AckPolicy for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn counts_toward_quorum(&self, node: &str) -> bool {
        self(node)
    }
}

/// Completion handler for asynchronous commits
pub type AckCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// How the committing thread learns the outcome
pub enum AckMode {
    /// Block in [`AckTracker::await_acks`]
    Sync,
    /// Deliver the outcome to the callback
    Async(AckCallback),
}

impl std::fmt::Debug for AckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => f.write_str("Sync"),
            Self::Async(_) => f.write_str("Async(..)"),
        }
    }
}

/// A commit as the tracker sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitTxn {
    /// Transaction id
    pub txn_id: TxnId,
    /// Sequence number of the commit record
    pub vlsn: Vlsn,
    /// Acks the durability policy requires
    pub required_acks: u32,
    /// How long acks may take
    pub ack_timeout: Duration,
}

impl CommitTxn {
    /// Commit needing `required_acks` within `ack_timeout`
    pub fn new(txn_id: TxnId, vlsn: Vlsn, required_acks: u32, ack_timeout: Duration) -> Self {
        Self {
            txn_id,
            vlsn,
            required_acks,
            ack_timeout,
        }
    }
}

struct PendingState {
    acked: HashSet<String>,
    callback: Option<AckCallback>,
    terminated: bool,
}

struct PendingTxn {
    txn: CommitTxn,
    deadline: Instant,
    is_async: bool,
    state: Mutex<PendingState>,
    done: Condvar,
}

impl PendingTxn {
    fn quorum_met(&self, state: &PendingState) -> bool {
        state.acked.len() as u32 >= self.txn.required_acks
    }

    fn insufficient(&self, state: &PendingState) -> Error {
        Error::InsufficientAcks {
            txn_id: self.txn.txn_id,
            required: self.txn.required_acks,
            received: state.acked.len() as u32,
            timeout: self.txn.ack_timeout,
        }
    }
}

/// Point-in-time tracker counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckStats {
    /// Sequence number of the newest commit seen by `await_acks`
    pub last_commit_vlsn: i64,
    /// Wall-clock time of that commit, in ms since the epoch
    pub last_commit_ms: u64,
    /// Commits seen by `await_acks`
    pub commits: u64,
    /// Commits per second since the tracker started
    pub commit_rate: f64,
    /// Transactions that reached their quorum
    pub acked: u64,
    /// Transactions that expired or were terminated without a quorum
    pub not_acked: u64,
    /// Acks counted toward a quorum
    pub acks_counted: u64,
    /// Acks ignored as duplicate, late or from a non-qualifying node
    pub acks_ignored: u64,
    /// Async transactions failed by the expiry sweep
    pub expired: u64,
    /// Panics caught while running callbacks
    pub callback_panics: u64,
}

#[derive(Default)]
struct Counters {
    last_commit_vlsn: AtomicI64,
    last_commit_ms: AtomicU64,
    commits: AtomicU64,
    acked: AtomicU64,
    not_acked: AtomicU64,
    acks_counted: AtomicU64,
    acks_ignored: AtomicU64,
    expired: AtomicU64,
    callback_panics: AtomicU64,
}

struct Inner {
    pending: DashMap<TxnId, Arc<PendingTxn>>,
    null_txn: Mutex<Option<Arc<PendingTxn>>>,
    policy: Box<dyn AckPolicy>,
    /// Held shared by registrations, exclusively while closing
    registration: RwLock<()>,
    closed: AtomicBool,
    counters: Counters,
    started: Instant,
}

impl Inner {
    fn lookup(&self, txn_id: TxnId) -> Option<Arc<PendingTxn>> {
        if txn_id == NULL_TXN_ID {
            return self.null_txn.lock().clone();
        }
        self.pending.get(&txn_id).map(|entry| entry.value().clone())
    }

    /// Remove `entry` unless a newer registration replaced it
    fn remove(&self, entry: &Arc<PendingTxn>) {
        let txn_id = entry.txn.txn_id;
        if txn_id == NULL_TXN_ID {
            let mut slot = self.null_txn.lock();
            if slot.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, entry)) {
                *slot = None;
            }
            return;
        }
        self.pending
            .remove_if(&txn_id, |_, cur| Arc::ptr_eq(cur, entry));
    }

    fn all_pending(&self) -> Vec<Arc<PendingTxn>> {
        let mut entries: Vec<_> = self.pending.iter().map(|e| e.value().clone()).collect();
        if let Some(null) = self.null_txn.lock().clone() {
            entries.push(null);
        }
        entries
    }

    fn run_callback(&self, txn_id: TxnId, callback: AckCallback, outcome: Result<()>) {
        if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
            self.counters.callback_panics.fetch_add(1, Ordering::Relaxed);
            error!("Ack callback for txn {} panicked", txn_id);
        }
    }

    fn record_outcome(&self, success: bool) {
        if success {
            self.counters.acked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.not_acked.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Complete async entries whose deadline is at or before `now`
    fn expire(&self, now: Instant) -> usize {
        let due: Vec<_> = self
            .all_pending()
            .into_iter()
            .filter(|p| p.is_async && p.deadline <= now)
            .collect();

        let mut fired = 0;
        for entry in due {
            let (callback, outcome) = {
                let mut state = entry.state.lock();
                let Some(callback) = state.callback.take() else {
                    continue;
                };
                let outcome = if entry.quorum_met(&state) {
                    Ok(())
                } else {
                    Err(entry.insufficient(&state))
                };
                (callback, outcome)
            };
            self.remove(&entry);
            self.record_outcome(outcome.is_ok());
            if outcome.is_err() {
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Txn {} at {} expired waiting for acks",
                    entry.txn.txn_id, entry.txn.vlsn
                );
            }
            self.run_callback(entry.txn.txn_id, callback, outcome);
            fired += 1;
        }
        fired
    }
}

/// Tracks commits awaiting acknowledgment quorums for one node
pub struct AckTracker {
    inner: Arc<Inner>,
    stop: Mutex<Option<Sender<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AckTracker {
    /// Tracker counting every node, sweeping expired entries every `sweep_period`
    pub fn new(sweep_period: Duration) -> Self {
        Self::with_policy(Box::new(AllNodes), sweep_period)
    }

    /// Tracker with an explicit quorum policy
    pub fn with_policy(policy: Box<dyn AckPolicy>, sweep_period: Duration) -> Self {
        let inner = Arc::new(Inner {
            pending: DashMap::new(),
            null_txn: Mutex::new(None),
            policy,
            registration: RwLock::new(()),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            started: Instant::now(),
        });
        let (stop_tx, stop_rx) = bounded(0);

        let sweep_inner = inner.clone();
        let period = sweep_period.max(Duration::from_millis(1));
        let handle = thread::Builder::new()
            .name("ack-sweeper".to_string())
            .spawn(move || Self::sweeper_thread(sweep_inner, stop_rx, period))
            .ok();
        if handle.is_none() {
            warn!("Could not start the ack sweeper, async commits expire only on shutdown");
        }

        Self {
            inner,
            stop: Mutex::new(Some(stop_tx)),
            sweeper: Mutex::new(handle),
        }
    }

    fn sweeper_thread(inner: Arc<Inner>, stop: Receiver<()>, period: Duration) {
        let ticker = tick(period);
        loop {
            select! {
                recv(ticker) -> _ => {
                    let fired = inner.expire(Instant::now());
                    if fired > 0 {
                        debug!("Ack sweep completed {} async commits", fired);
                    }
                }
                recv(stop) -> _ => break,
            }
        }
    }

    /// Start tracking `txn`.
    ///
    /// A commit needing no acks is not tracked; an async callback for it
    /// fires immediately with success.
    pub fn register_for_ack(&self, txn: &CommitTxn, mode: AckMode) -> Result<()> {
        // Shutdown cannot snapshot the pending set between the check and the insert.
        let _registration = self.inner.registration.read();
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::session_terminated(format!(
                "Ack tracker closed, cannot register txn {}",
                txn.txn_id
            )));
        }
        if txn.required_acks == 0 {
            if let AckMode::Async(callback) = mode {
                self.inner.run_callback(txn.txn_id, callback, Ok(()));
            }
            return Ok(());
        }

        let (is_async, callback) = match mode {
            AckMode::Sync => (false, None),
            AckMode::Async(callback) => (true, Some(callback)),
        };
        let entry = Arc::new(PendingTxn {
            txn: *txn,
            deadline: Instant::now() + txn.ack_timeout,
            is_async,
            state: Mutex::new(PendingState {
                acked: HashSet::new(),
                callback,
                terminated: false,
            }),
            done: Condvar::new(),
        });

        let replaced = if txn.txn_id == NULL_TXN_ID {
            self.inner.null_txn.lock().replace(entry)
        } else {
            self.inner.pending.insert(txn.txn_id, entry)
        };
        if replaced.is_some() {
            warn!("Txn {} registered for acks twice", txn.txn_id);
        }
        Ok(())
    }

    /// Count an ack from `source`; returns whether it counted
    pub fn note_ack(&self, source: &str, txn_id: TxnId) -> bool {
        let counters = &self.inner.counters;
        let Some(entry) = self.inner.lookup(txn_id) else {
            counters.acks_ignored.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        if !self.inner.policy.counts_toward_quorum(source) {
            debug!("Ignoring ack for txn {} from non-voting {}", txn_id, source);
            counters.acks_ignored.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let completed = {
            let mut state = entry.state.lock();
            if state.terminated || !state.acked.insert(source.to_string()) {
                counters.acks_ignored.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            counters.acks_counted.fetch_add(1, Ordering::Relaxed);
            if !entry.quorum_met(&state) {
                return true;
            }
            if entry.is_async {
                state.callback.take()
            } else {
                entry.done.notify_all();
                None
            }
        };

        if let Some(callback) = completed {
            self.inner.remove(&entry);
            self.inner.record_outcome(true);
            self.inner.run_callback(txn_id, callback, Ok(()));
        }
        true
    }

    /// Wait for `txn`'s quorum.
    ///
    /// Commit telemetry is recorded for every call. Sync entries block up to
    /// `timeout` and are always removed; async entries return immediately.
    pub fn await_acks(&self, txn: &CommitTxn, timeout: Duration) -> Result<()> {
        self.record_commit(txn.vlsn);

        let Some(entry) = self.inner.lookup(txn.txn_id) else {
            return Ok(());
        };
        if entry.is_async {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let outcome = {
            let mut state = entry.state.lock();
            entry.done.wait_while_until(
                &mut state,
                |s| !s.terminated && (s.acked.len() as u32) < entry.txn.required_acks,
                deadline,
            );
            if entry.quorum_met(&state) {
                Ok(())
            } else if state.terminated {
                Err(Error::session_terminated(format!(
                    "Shut down while txn {} awaited acks",
                    txn.txn_id
                )))
            } else {
                Err(entry.insufficient(&state))
            }
        };

        self.inner.remove(&entry);
        self.inner.record_outcome(outcome.is_ok());
        if let Err(e) = &outcome {
            warn!("Txn {} at {}: {}", txn.txn_id, txn.vlsn, e);
        }
        outcome
    }

    fn record_commit(&self, vlsn: Vlsn) {
        let c = &self.inner.counters;
        c.last_commit_vlsn.fetch_max(vlsn.sequence(), Ordering::AcqRel);
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        c.last_commit_ms.store(now_ms, Ordering::Relaxed);
        c.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Acks still missing for `txn_id`, if it is pending
    pub fn remaining_acks(&self, txn_id: TxnId) -> Option<u32> {
        let entry = self.inner.lookup(txn_id)?;
        let state = entry.state.lock();
        Some(
            entry
                .txn
                .required_acks
                .saturating_sub(state.acked.len() as u32),
        )
    }

    /// Pending transactions
    pub fn pending(&self) -> usize {
        self.inner.pending.len() + usize::from(self.inner.null_txn.lock().is_some())
    }

    /// Run one expiry pass as of `now`; returns the callbacks fired
    pub fn expire(&self, now: Instant) -> usize {
        self.inner.expire(now)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> AckStats {
        let c = &self.inner.counters;
        let commits = c.commits.load(Ordering::Relaxed);
        let elapsed = self.inner.started.elapsed().as_secs_f64();
        AckStats {
            last_commit_vlsn: c.last_commit_vlsn.load(Ordering::Relaxed),
            last_commit_ms: c.last_commit_ms.load(Ordering::Relaxed),
            commits,
            commit_rate: if elapsed > 0.0 {
                commits as f64 / elapsed
            } else {
                0.0
            },
            acked: c.acked.load(Ordering::Relaxed),
            not_acked: c.not_acked.load(Ordering::Relaxed),
            acks_counted: c.acks_counted.load(Ordering::Relaxed),
            acks_ignored: c.acks_ignored.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            callback_panics: c.callback_panics.load(Ordering::Relaxed),
        }
    }

    /// Whether `shutdown` has run
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Fail every pending transaction and stop the sweeper.
    ///
    /// Sync waiters wake with `SessionTerminated`; async callbacks that have
    /// not fired yet fire with the same error.
    pub fn shutdown(&self) -> Result<()> {
        {
            let _registration = self.inner.registration.write();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }

        let entries = self.inner.all_pending();
        let count = entries.len();
        for entry in entries {
            let callback = {
                let mut state = entry.state.lock();
                state.terminated = true;
                entry.done.notify_all();
                state.callback.take()
            };
            if let Some(callback) = callback {
                self.inner.remove(&entry);
                self.inner.record_outcome(false);
                self.inner.run_callback(
                    entry.txn.txn_id,
                    callback,
                    Err(Error::session_terminated(format!(
                        "Shut down while txn {} awaited acks",
                        entry.txn.txn_id
                    ))),
                );
            }
        }

        drop(self.stop.lock().take());
        if let Some(handle) = self.sweeper.lock().take() {
            handle
                .join()
                .map_err(|_| Error::invalid_state("Ack sweeper thread panicked"))?;
        }
        info!("Ack tracker shut down with {} pending transactions", count);
        Ok(())
    }
}

impl Drop for AckTracker {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
