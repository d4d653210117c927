//! Feeder session
//!
//! One feeder serves one consumer over one channel: version handshake,
//! matchpoint syncup, then a steady stream of entries. The output loop runs
//! on the caller's thread; a spawned input thread reads acknowledgments and
//! heartbeat responses.

use crate::acks::AckTracker;
use crate::channel::Channel;
use crate::config::StreamConfig;
use crate::feed::{ArbiterFeed, DurabilityGate, FeedSource, LogItemCache};
use crate::leader::LeaderStatusTracker;
use crate::log::{LogRecord, LogStore, VlsnIndex};
use crate::matchpoint::{DbIdLookup, FeederSyncup, RestorePeers};
use crate::protocol::version::BEFORE_IMAGE_VERSION;
use crate::protocol::{FilterStats, LocalNode, Message, NodeType, SyncPolicy, feeder_handshake};
use crate::vlsn::Vlsn;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Feeder session statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeederStats {
    /// Peer name
    pub peer: String,
    /// Negotiated protocol version
    pub protocol_version: u16,
    /// First sequence number streamed
    pub start_vlsn: i64,
    /// Newest sequence number sent
    pub last_sent_vlsn: i64,
    /// Entries sent, commits included
    pub entries_sent: u64,
    /// Commits sent asking for an ack
    pub commits_sent: u64,
    /// Heartbeats sent
    pub heartbeats_sent: u64,
    /// Heartbeat responses received
    pub heartbeat_responses: u64,
    /// Transaction acks received
    pub acks_received: u64,
    /// Newest transaction end the consumer reported
    pub consumer_txn_end_vlsn: i64,
    /// Newest durable entry the consumer reported
    pub consumer_durable_vlsn: i64,
    /// Subscription filter counts reported by the consumer
    pub filter_passed: i64,
    /// Entries the consumer's filter dropped
    pub filter_filtered: i64,
    /// Heartbeat responses whose sender clock was beyond the skew limit
    pub clock_skew_warnings: u64,
}

struct Shared {
    shutdown_requested: AtomicBool,
    stopped: AtomicBool,
    running: AtomicBool,
    stats: Mutex<FeederStats>,
    arbiter_feed: Arc<ArbiterFeed>,
}

/// Control handle for a running feeder
#[derive(Clone)]
pub struct FeederHandle {
    shared: Arc<Shared>,
}

impl FeederHandle {
    /// Ask the feeder to send `ShutdownRequest` and stop
    pub fn shutdown(&self) {
        self.shared.shutdown_requested.store(true, Ordering::Release);
    }

    /// Whether the session is between syncup and exit
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> FeederStats {
        self.shared.stats.lock().clone()
    }

    /// Commits waiting for an arbiter; only drained by arbiter sessions
    pub fn arbiter_feed(&self) -> Arc<ArbiterFeed> {
        self.shared.arbiter_feed.clone()
    }
}

/// Feeder side of a replication stream
pub struct Feeder {
    channel: Arc<dyn Channel>,
    local: LocalNode,
    store: Arc<dyn LogStore>,
    index: Arc<dyn VlsnIndex>,
    config: StreamConfig,
    acks: Arc<AckTracker>,
    leader: Arc<LeaderStatusTracker>,
    cache: Option<Arc<LogItemCache>>,
    durability: Option<Arc<dyn DurabilityGate>>,
    db_ids: Option<Arc<dyn DbIdLookup>>,
    restore: Option<Arc<dyn RestorePeers>>,
    sync_policy: SyncPolicy,
    shared: Arc<Shared>,
}

impl Feeder {
    /// Feeder for the consumer at the other end of `channel`
    pub fn new(
        channel: Arc<dyn Channel>,
        local: LocalNode,
        store: Arc<dyn LogStore>,
        index: Arc<dyn VlsnIndex>,
        config: StreamConfig,
        acks: Arc<AckTracker>,
        leader: Arc<LeaderStatusTracker>,
    ) -> Self {
        let arbiter_feed = Arc::new(ArbiterFeed::new(config.overflow_queue_capacity));
        Self {
            channel,
            local,
            store,
            index,
            config,
            acks,
            leader,
            cache: None,
            durability: None,
            db_ids: None,
            restore: None,
            sync_policy: SyncPolicy::NoSync,
            shared: Arc::new(Shared {
                shutdown_requested: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stats: Mutex::new(FeederStats::default()),
                arbiter_feed,
            }),
        }
    }

    /// Serve records from a shared item cache first
    pub fn with_cache(mut self, cache: Arc<LogItemCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Group durable point; used when the config asks for durable-only streams
    pub fn with_durability_gate(mut self, gate: Arc<dyn DurabilityGate>) -> Self {
        self.durability = Some(gate);
        self
    }

    /// Answer database id lookups during syncup
    pub fn with_db_ids(mut self, db_ids: Arc<dyn DbIdLookup>) -> Self {
        self.db_ids = Some(db_ids);
        self
    }

    /// Restore candidates for consumers that cannot sync
    pub fn with_restore_peers(mut self, restore: Arc<dyn RestorePeers>) -> Self {
        self.restore = Some(restore);
        self
    }

    /// Sync policy sent with acknowledged commits
    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    /// Handle for shutdown and statistics
    pub fn handle(&self) -> FeederHandle {
        FeederHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run the session to completion
    pub fn run(self) -> Result<FeederStats> {
        let result = self.run_session();
        self.shared.running.store(false, Ordering::Release);
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.arbiter_feed.clear();
        match &result {
            Ok(()) => info!("Feeder for {} stopped", self.channel.peer_name()),
            Err(e) if e.is_fatal() => {
                error!("Feeder for {} failed: {}", self.channel.peer_name(), e)
            }
            Err(e) => warn!("Feeder for {}: {}", self.channel.peer_name(), e),
        }
        if result.is_err() {
            self.channel.close();
        }
        result.map(|()| self.shared.stats.lock().clone())
    }

    fn run_session(&self) -> Result<()> {
        let handshake = feeder_handshake(self.channel.as_ref(), &self.local, self.config.feeder_timeout)?;

        let mut syncup = FeederSyncup::new(
            self.channel.clone(),
            self.store.clone(),
            self.index.clone(),
            handshake.peer_type,
            self.config.clone(),
        );
        if let Some(db_ids) = &self.db_ids {
            syncup = syncup.with_db_ids(db_ids.clone());
        }
        if let Some(restore) = &self.restore {
            syncup = syncup.with_restore_peers(restore.clone());
        }
        let outcome = syncup.run()?;
        if let Some(filter) = &outcome.filter {
            debug!(
                "{} subscribed with a {} byte filter",
                handshake.peer_name,
                filter.len()
            );
        }

        {
            let mut stats = self.shared.stats.lock();
            stats.peer = handshake.peer_name.clone();
            stats.protocol_version = handshake.context.version;
            stats.start_vlsn = outcome.start.sequence();
        }
        self.shared.running.store(true, Ordering::Release);

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let input = self.spawn_input(shutdown_tx)?;

        let output = if handshake.peer_type == NodeType::Arbiter {
            self.arbiter_loop(&shutdown_rx)
        } else {
            self.output_loop(outcome.start, &shutdown_rx)
        };

        self.shared.stopped.store(true, Ordering::Release);
        let input = input
            .join()
            .map_err(|_| Error::invalid_state("Feeder input thread panicked"))?;
        output.and(input)
    }

    fn spawn_input(&self, shutdown_tx: Sender<()>) -> Result<JoinHandle<Result<()>>> {
        let channel = self.channel.clone();
        let acks = self.acks.clone();
        let shared = self.shared.clone();
        let poll = self.config.record_wait;
        let max_skew = self.config.max_clock_skew;
        thread::Builder::new()
            .name(format!("feeder-input-{}", channel.peer_name()))
            .spawn(move || {
                let result = input_loop(channel.as_ref(), &acks, &shared, poll, max_skew, &shutdown_tx);
                if result.is_err() {
                    shared.stopped.store(true, Ordering::Release);
                }
                result
            })
            .map_err(Error::Io)
    }

    fn heartbeat(&self, id: &mut i64) -> Result<()> {
        *id += 1;
        self.channel.send(&Message::Heartbeat {
            master_now_ms: now_ms(),
            current_txn_end_vlsn: self.index.range().last_txn_end,
            heartbeat_id: *id,
        })?;
        self.shared.stats.lock().heartbeats_sent += 1;
        Ok(())
    }

    /// Returns true once the session should end
    fn check_shutdown(&self, shutdown_rx: &Receiver<()>) -> Result<bool> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Ok(true);
        }
        if !self.shared.shutdown_requested.load(Ordering::Acquire) {
            return Ok(false);
        }
        info!("Shutting down feeder for {}", self.channel.peer_name());
        self.channel.send(&Message::ShutdownRequest {
            shutdown_time_ms: now_ms(),
        })?;
        if shutdown_rx.recv_timeout(self.config.feeder_timeout).is_err() {
            warn!(
                "{} did not answer the shutdown request within {:?}",
                self.channel.peer_name(),
                self.config.feeder_timeout
            );
        }
        Ok(true)
    }

    fn output_loop(&self, start: Vlsn, shutdown_rx: &Receiver<()>) -> Result<()> {
        let mut source = FeedSource::new(self.store.clone(), self.index.clone(), start)?
            .with_slow_scan_warning(self.config.scan_warn_threshold());
        if let Some(cache) = &self.cache {
            source = source.with_cache(cache.clone());
        }
        if self.config.durable_only {
            match &self.durability {
                Some(gate) => source = source.with_durability_gate(gate.clone()),
                None => warn!("Durable-only stream requested without a durability gate"),
            }
        }

        let result = self.stream(&mut source, start, shutdown_rx);
        if let Some(held) = source.held() {
            debug!("Releasing held record {} on feeder exit", held);
        }
        source.release();
        result
    }

    fn stream(&self, source: &mut FeedSource, start: Vlsn, shutdown_rx: &Receiver<()>) -> Result<()> {
        let include_before_image = self.channel.context().supports(BEFORE_IMAGE_VERSION);
        let mut next = start;
        let mut heartbeat_id = 0;
        let mut last_heartbeat = Instant::now();

        loop {
            if self.check_shutdown(shutdown_rx)? {
                return Ok(());
            }
            self.leader.assert_in_sync()?;

            if let Some(record) = source.get_record(next, self.config.record_wait, include_before_image)? {
                self.send_record(record)?;
                next = next.next();
            }
            if last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                self.heartbeat(&mut heartbeat_id)?;
                last_heartbeat = Instant::now();
            }
        }
    }

    fn send_record(&self, record: LogRecord) -> Result<()> {
        let vlsn = record.vlsn;
        let needs_ack = record
            .txn_id()
            .is_some_and(|txn_id| self.acks.remaining_acks(txn_id).is_some());
        let message = if needs_ack {
            Message::Commit {
                needs_ack: true,
                sync_policy: self.sync_policy,
                record: record.to_wire(),
            }
        } else if let Some(before_image) = record.before_image.clone() {
            Message::EntryWithBeforeImage {
                record: record.to_wire(),
                before_image,
            }
        } else {
            Message::Entry {
                record: record.to_wire(),
            }
        };
        drop(record);
        self.channel.send(&message)?;

        let mut stats = self.shared.stats.lock();
        stats.entries_sent += 1;
        stats.last_sent_vlsn = vlsn.sequence();
        if needs_ack {
            stats.commits_sent += 1;
        }
        Ok(())
    }

    fn arbiter_loop(&self, shutdown_rx: &Receiver<()>) -> Result<()> {
        let feed = self.shared.arbiter_feed.clone();
        let mut heartbeat_id = 0;
        let mut last_heartbeat = Instant::now();
        loop {
            if self.check_shutdown(shutdown_rx)? {
                return Ok(());
            }
            self.leader.assert_in_sync()?;

            if let Some(record) = feed.next(self.config.record_wait) {
                let vlsn = record.vlsn;
                self.channel.send(&Message::Commit {
                    needs_ack: true,
                    sync_policy: SyncPolicy::NoSync,
                    record: record.to_wire(),
                })?;
                let mut stats = self.shared.stats.lock();
                stats.entries_sent += 1;
                stats.commits_sent += 1;
                stats.last_sent_vlsn = stats.last_sent_vlsn.max(vlsn.sequence());
            }
            if last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                self.heartbeat(&mut heartbeat_id)?;
                last_heartbeat = Instant::now();
            }
        }
    }
}

fn input_loop(
    channel: &dyn Channel,
    acks: &AckTracker,
    shared: &Shared,
    poll: Duration,
    max_skew: Duration,
    shutdown_tx: &Sender<()>,
) -> Result<()> {
    let peer = channel.peer_name();
    while !shared.stopped.load(Ordering::Acquire) {
        let Some(message) = channel.receive(poll)? else {
            continue;
        };
        match message {
            Message::Ack { txn_id, local_durable_vlsn } => {
                acks.note_ack(&peer, txn_id);
                let mut stats = shared.stats.lock();
                stats.acks_received += 1;
                stats.consumer_durable_vlsn =
                    stats.consumer_durable_vlsn.max(local_durable_vlsn.sequence());
            }
            Message::GroupAck { txn_ids } => {
                for txn_id in &txn_ids {
                    acks.note_ack(&peer, *txn_id);
                }
                shared.stats.lock().acks_received += txn_ids.len() as u64;
            }
            Message::HeartbeatResponse {
                txn_end_vlsn,
                heartbeat_id,
                filter_stats,
                sender_time_ms,
                local_durable_vlsn,
                ..
            } => {
                let skewed = sender_time_ms != 0
                    && (now_ms() - sender_time_ms).unsigned_abs() > max_skew.as_millis() as u64;
                if skewed {
                    warn!(
                        "Clock of {} differs by more than {:?} (heartbeat {})",
                        peer, max_skew, heartbeat_id
                    );
                }
                let FilterStats { passed, filtered } = filter_stats;
                let mut stats = shared.stats.lock();
                stats.heartbeat_responses += 1;
                stats.consumer_txn_end_vlsn = stats.consumer_txn_end_vlsn.max(txn_end_vlsn.sequence());
                stats.consumer_durable_vlsn =
                    stats.consumer_durable_vlsn.max(local_durable_vlsn.sequence());
                stats.filter_passed = passed;
                stats.filter_filtered = filtered;
                if skewed {
                    stats.clock_skew_warnings += 1;
                }
            }
            Message::ShutdownResponse => {
                debug!("{} acknowledged shutdown", peer);
                let _ = shutdown_tx.try_send(());
                return Ok(());
            }
            Message::KeepaliveResponse { .. } => {}
            other => {
                return Err(Error::protocol(format!(
                    "Unexpected {:?} from {} on the feeder input",
                    other.opcode(),
                    peer
                )));
            }
        }
    }
    Ok(())
}
