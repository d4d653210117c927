//! Consumer side of the matchpoint search
//!
//! A replica walks its own sync points from newest to oldest and asks the
//! feeder for the entry at each one until the two logs agree. Entries past
//! the agreed point are rolled back before streaming starts.

use crate::channel::Channel;
use crate::log::LogRecord;
use crate::protocol::{EntryRequestMode, Message, NodeType};
use crate::vlsn::{Vlsn, VlsnRange};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The consumer's own log, as far as syncup needs it
pub trait LocalLog: Send + Sync {
    /// Local range
    fn range(&self) -> VlsnRange;

    /// Newest visible sync point at or below `vlsn`
    fn sync_point_at_or_before(&self, vlsn: Vlsn) -> Option<LogRecord>;

    /// Visible entry with this sequence number
    fn record(&self, vlsn: Vlsn) -> Option<LogRecord>;

    /// Roll back every entry above `vlsn`; NULL removes everything
    fn truncate_after(&self, vlsn: Vlsn) -> Result<()>;
}

/// Wait for the feeder's next reply, echoing keepalives sent while it scans
fn await_reply(channel: &dyn Channel, timeout: Duration) -> Result<Message> {
    loop {
        let message = channel.receive(timeout)?.ok_or_else(|| {
            Error::sync_failed(format!(
                "No reply from {} within {:?}",
                channel.peer_name(),
                timeout
            ))
        })?;
        match message {
            Message::Keepalive { id } => {
                channel.send(&Message::KeepaliveResponse { id })?;
            }
            other => return Ok(other),
        }
    }
}

/// Ask for restore candidates and turn them into the terminal error
fn request_restore(channel: &dyn Channel, failed_vlsn: Vlsn, timeout: Duration) -> Result<Error> {
    channel.send(&Message::RestoreRequest { failed_vlsn })?;
    match await_reply(channel, timeout)? {
        Message::RestoreResponse { cbvlsn, peers } => {
            warn!(
                "No matchpoint with {} at {}; restore through {} from {} peers",
                channel.peer_name(),
                failed_vlsn,
                cbvlsn,
                peers.len()
            );
            Ok(Error::NetworkRestoreRequired {
                vlsn: failed_vlsn,
                reason: format!("no common matchpoint, restore must reach {}", cbvlsn),
                peers,
            })
        }
        other => Err(Error::protocol(format!(
            "Expected RestoreResponse, got {:?}",
            other.opcode()
        ))),
    }
}

/// Look up a database id on the feeder; `None` when unknown
pub fn request_db_id(channel: &dyn Channel, db_name: &str, timeout: Duration) -> Result<Option<i64>> {
    channel.send(&Message::DbIdRequest {
        db_name: db_name.to_string(),
    })?;
    match await_reply(channel, timeout)? {
        Message::DbIdResponse { db_id, .. } if db_id < 0 => Ok(None),
        Message::DbIdResponse { db_id, .. } => Ok(Some(db_id)),
        other => Err(Error::protocol(format!(
            "Expected DbIdResponse, got {:?}",
            other.opcode()
        ))),
    }
}

/// Replica and arbiter syncup
pub struct ReplicaSyncup {
    channel: Arc<dyn Channel>,
    local: Arc<dyn LocalLog>,
    node_type: NodeType,
    timeout: Duration,
    probes: u32,
}

impl ReplicaSyncup {
    /// Syncup over `channel` against the consumer's `local` log
    pub fn new(
        channel: Arc<dyn Channel>,
        local: Arc<dyn LocalLog>,
        node_type: NodeType,
        timeout: Duration,
    ) -> Self {
        Self {
            channel,
            local,
            node_type,
            timeout,
            probes: 0,
        }
    }

    /// Entry requests sent so far
    pub fn probes(&self) -> u32 {
        self.probes
    }

    fn probe(&mut self, vlsn: Vlsn, mode: EntryRequestMode) -> Result<Message> {
        self.probes += 1;
        self.channel.send(&Message::EntryRequest { vlsn, mode })?;
        await_reply(self.channel.as_ref(), self.timeout)
    }

    fn start(&self, vlsn: Vlsn) -> Result<Vlsn> {
        self.channel.send(&Message::StartStream { vlsn, filter: None })?;
        info!(
            "Matchpoint with {} agreed, streaming from {} after {} probes",
            self.channel.peer_name(),
            vlsn,
            self.probes
        );
        Ok(vlsn)
    }

    /// Agree on a start point; returns the first sequence number to receive
    pub fn run(&mut self) -> Result<Vlsn> {
        if self.node_type == NodeType::Arbiter {
            return self.run_arbiter();
        }

        let range = self.local.range();
        let mut candidate = if range.is_empty() {
            None
        } else {
            self.local.sync_point_at_or_before(range.last)
        };

        loop {
            let requested = candidate.as_ref().map_or(Vlsn::FIRST, |c| c.vlsn);
            match self.probe(requested, EntryRequestMode::Default)? {
                Message::Entry { record } => {
                    let Some(local) = candidate.take() else {
                        // Nothing durable locally: drop any partial transaction.
                        self.local.truncate_after(Vlsn::NULL)?;
                        return self.start(Vlsn::FIRST);
                    };
                    let remote = LogRecord::from_wire(record);
                    if local.matches(&remote) {
                        self.local.truncate_after(local.vlsn)?;
                        return self.start(local.vlsn.next());
                    }
                    debug!(
                        "Sync point {} differs from {}'s entry, trying an earlier one",
                        local.vlsn,
                        self.channel.peer_name()
                    );
                    candidate = self.local.sync_point_at_or_before(local.vlsn.prev());
                    if candidate.is_none() {
                        return Err(request_restore(self.channel.as_ref(), requested, self.timeout)?);
                    }
                }
                Message::AltMatchpoint { record } => {
                    debug!(
                        "{} proposed alternate matchpoint {}",
                        self.channel.peer_name(),
                        record.vlsn
                    );
                    candidate = self.local.sync_point_at_or_before(record.vlsn);
                    if candidate.is_none() {
                        return Err(request_restore(self.channel.as_ref(), requested, self.timeout)?);
                    }
                }
                Message::EntryNotFound => {
                    return Err(request_restore(self.channel.as_ref(), requested, self.timeout)?);
                }
                other => {
                    return Err(Error::protocol(format!(
                        "Unexpected {:?} from {} during syncup",
                        other.opcode(),
                        self.channel.peer_name()
                    )));
                }
            }
        }
    }

    /// Arbiters keep no log and only need the feeder's tip
    fn run_arbiter(&mut self) -> Result<Vlsn> {
        match self.probe(Vlsn::FIRST, EntryRequestMode::Now)? {
            Message::Entry { record } => self.start(record.vlsn.next()),
            Message::EntryNotFound => self.start(Vlsn::FIRST),
            other => Err(Error::protocol(format!(
                "Unexpected {:?} from {} during arbiter syncup",
                other.opcode(),
                self.channel.peer_name()
            ))),
        }
    }
}

/// Syncup for filtered subscription clients
pub struct SubscriberSyncup {
    channel: Arc<dyn Channel>,
    start: Vlsn,
    mode: EntryRequestMode,
    filter: Option<Bytes>,
    timeout: Duration,
}

impl SubscriberSyncup {
    /// Subscribe from `start` under `mode`
    pub fn new(channel: Arc<dyn Channel>, start: Vlsn, mode: EntryRequestMode, timeout: Duration) -> Self {
        Self {
            channel,
            start,
            mode,
            filter: None,
            timeout,
        }
    }

    /// Serialized filter the feeder applies to the stream
    pub fn with_filter(mut self, filter: Bytes) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Look up a database id before starting
    pub fn request_db_id(&self, db_name: &str) -> Result<Option<i64>> {
        request_db_id(self.channel.as_ref(), db_name, self.timeout)
    }

    /// Agree on a start point; returns the first sequence number streamed
    pub fn run(&mut self) -> Result<Vlsn> {
        self.channel.send(&Message::EntryRequest {
            vlsn: self.start,
            mode: self.mode,
        })?;
        let vlsn = match await_reply(self.channel.as_ref(), self.timeout)? {
            Message::Entry { record } | Message::AltMatchpoint { record } => record.vlsn,
            Message::EntryNotFound => {
                return Err(request_restore(self.channel.as_ref(), self.start, self.timeout)?);
            }
            other => {
                return Err(Error::protocol(format!(
                    "Unexpected {:?} from {} during subscription syncup",
                    other.opcode(),
                    self.channel.peer_name()
                )));
            }
        };
        self.channel.send(&Message::StartStream {
            vlsn,
            filter: self.filter.clone(),
        })?;
        info!(
            "Subscription to {} starts at {} (requested {} {:?})",
            self.channel.peer_name(),
            vlsn,
            self.start,
            self.mode
        );
        Ok(vlsn)
    }
}
