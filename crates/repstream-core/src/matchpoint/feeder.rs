//! Feeder side of the matchpoint search

use super::decision::{Decision, EntryProbe, decide};
use crate::channel::Channel;
use crate::config::StreamConfig;
use crate::keepalive::Keepalive;
use crate::log::{LogRecord, LogScanner, LogStore, ScanOutcome, VlsnIndex};
use crate::protocol::{Message, NodeType, PeerInfo};
use crate::vlsn::Vlsn;
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Database name to id resolution
pub trait DbIdLookup: Send + Sync {
    /// Id of the named database
    fn db_id(&self, db_name: &str) -> Option<i64>;
}

/// Peers able to serve a network restore
pub trait RestorePeers: Send + Sync {
    /// Group durable point and the peers holding it
    fn restore_peers(&self) -> (Vlsn, Vec<PeerInfo>);
}

/// Agreed starting point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncupOutcome {
    /// First sequence number to stream
    pub start: Vlsn,
    /// Subscription filter sent by the consumer
    pub filter: Option<Bytes>,
}

/// Runs the feeder half of the matchpoint protocol on one channel
pub struct FeederSyncup {
    channel: Arc<dyn Channel>,
    store: Arc<dyn LogStore>,
    index: Arc<dyn VlsnIndex>,
    requester: NodeType,
    config: StreamConfig,
    keepalive: Keepalive,
    db_ids: Option<Arc<dyn DbIdLookup>>,
    restore: Option<Arc<dyn RestorePeers>>,
    responses: u32,
    entries_scanned: u64,
}

impl FeederSyncup {
    /// Syncup for a consumer of kind `requester`
    pub fn new(
        channel: Arc<dyn Channel>,
        store: Arc<dyn LogStore>,
        index: Arc<dyn VlsnIndex>,
        requester: NodeType,
        config: StreamConfig,
    ) -> Self {
        let keepalive = Keepalive::new(channel.clone(), &config);
        Self {
            channel,
            store,
            index,
            requester,
            config,
            keepalive,
            db_ids: None,
            restore: None,
            responses: 0,
            entries_scanned: 0,
        }
    }

    /// Answer `DbIdRequest`s from this lookup
    pub fn with_db_ids(mut self, db_ids: Arc<dyn DbIdLookup>) -> Self {
        self.db_ids = Some(db_ids);
        self
    }

    /// Answer `RestoreRequest`s from this provider
    pub fn with_restore_peers(mut self, restore: Arc<dyn RestorePeers>) -> Self {
        self.restore = Some(restore);
        self
    }

    /// Replace the keepalive, e.g. to share it with the caller
    pub fn with_keepalive(mut self, keepalive: Keepalive) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Entries visited by matchpoint scans
    pub fn entries_scanned(&self) -> u64 {
        self.entries_scanned
    }

    /// Serve requests until the consumer starts the stream
    pub fn run(&mut self) -> Result<SyncupOutcome> {
        let peer = self.channel.peer_name();
        loop {
            let message = self.channel.receive(self.config.feeder_timeout)?.ok_or_else(|| {
                Error::sync_failed(format!(
                    "No syncup message from {} within {:?}",
                    peer, self.config.feeder_timeout
                ))
            })?;

            match message {
                Message::EntryRequest { vlsn, mode } => {
                    let probe = EntryProbe {
                        vlsn,
                        mode,
                        first_response: self.responses == 0,
                        requester: self.requester,
                    };
                    let range = self.index.range();
                    let decision = decide(&probe, &range, self.config.max_initial_replay)?;
                    debug!(
                        "Entry request {} ({:?}) from {} against {}: {:?}",
                        vlsn, mode, peer, range, decision
                    );
                    let reply = match decision {
                        Decision::Entry(v) => Message::Entry {
                            record: self.locate(v)?.to_wire(),
                        },
                        Decision::AltMatchpoint(v) => Message::AltMatchpoint {
                            record: self.locate(v)?.to_wire(),
                        },
                        Decision::NotFound => Message::EntryNotFound,
                    };
                    self.channel.send(&reply)?;
                    self.responses += 1;
                }
                Message::DbIdRequest { db_name } => {
                    let db_id = self
                        .db_ids
                        .as_ref()
                        .and_then(|lookup| lookup.db_id(&db_name))
                        .unwrap_or(-1);
                    self.channel.send(&Message::DbIdResponse { db_name, db_id })?;
                }
                Message::RestoreRequest { failed_vlsn } => {
                    let (cbvlsn, peers) = match &self.restore {
                        Some(restore) => restore.restore_peers(),
                        None => (self.index.range().last_txn_end, Vec::new()),
                    };
                    self.channel.send(&Message::RestoreResponse {
                        cbvlsn,
                        peers: peers.clone(),
                    })?;
                    warn!(
                        "{} cannot sync incrementally at {}, directed to {} restore peers",
                        peer,
                        failed_vlsn,
                        peers.len()
                    );
                    return Err(Error::NetworkRestoreRequired {
                        vlsn: failed_vlsn,
                        reason: format!("{} requested a network restore", peer),
                        peers,
                    });
                }
                Message::StartStream { vlsn, filter } => {
                    info!(
                        "{} starts streaming at {} after {} probes, {} entries scanned",
                        peer, vlsn, self.responses, self.entries_scanned
                    );
                    return Ok(SyncupOutcome { start: vlsn, filter });
                }
                Message::KeepaliveResponse { id } => self.keepalive.note_response(id),
                other => {
                    return Err(Error::protocol(format!(
                        "Unexpected {:?} from {} during syncup",
                        other.opcode(),
                        peer
                    )));
                }
            }
        }
    }

    fn scanner(&self) -> LogScanner {
        LogScanner::new(self.store.clone(), self.index.clone())
            .with_monitor(Box::new(self.keepalive.monitor()))
            .with_slow_scan_warning(self.config.scan_warn_threshold())
    }

    /// Find the record for `vlsn`, scanning back from the nearest indexed
    /// position and falling forward past cleaned files.
    pub fn locate(&mut self, vlsn: Vlsn) -> Result<LogRecord> {
        let mut scanner = self.scanner();
        scanner.init_backward(vlsn)?;
        let outcome = scanner.scan_backward(vlsn);
        self.entries_scanned += scanner.entries_scanned();

        match outcome? {
            ScanOutcome::Found(record) => Ok(record),
            ScanOutcome::Gap {
                from_file,
                to_file,
                vlsn,
            } => {
                debug!(
                    "Backward scan for {} hit cleaned files {}..={}, scanning forward",
                    vlsn, from_file, to_file
                );
                self.locate_forward(vlsn)
            }
            ScanOutcome::EndOfLog => {
                let range = self.index.range();
                if vlsn < range.first {
                    return Err(Error::network_restore(
                        vlsn,
                        format!("entry cleaned during the scan, range is now {}", range),
                    ));
                }
                Err(Error::invalid_state(format!(
                    "Entry {} within range {} but not in the log",
                    vlsn, range
                )))
            }
        }
    }

    fn locate_forward(&mut self, vlsn: Vlsn) -> Result<LogRecord> {
        let mut scanner = self.scanner();
        scanner.init_forward(vlsn)?;
        let found = scanner.scan_forward(vlsn, Duration::ZERO);
        self.entries_scanned += scanner.entries_scanned();

        match found {
            Ok(Some(record)) => Ok(record),
            Ok(None) | Err(Error::InvalidState(_)) => Err(Error::network_restore(
                vlsn,
                format!("entry lost to log cleaning, range is {}", self.index.range()),
            )),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{EntryType, MemoryLog};
    use crate::protocol::EntryRequestMode;

    fn log(entries: usize, per_file: usize) -> Arc<MemoryLog> {
        let log = Arc::new(MemoryLog::with_index_stride(per_file, 1000));
        for i in 0..entries {
            log.append(EntryType::Data, Bytes::from(format!("e{i}")));
        }
        log
    }

    fn syncup(log: &Arc<MemoryLog>) -> (FeederSyncup, crate::channel::MemoryChannel) {
        let (feeder, replica) = crate::channel::MemoryChannel::pair("feeder", "replica");
        let ctx = crate::protocol::ProtocolContext::stream(15);
        feeder.set_context(ctx);
        replica.set_context(ctx);
        let syncup = FeederSyncup::new(
            Arc::new(feeder),
            log.clone(),
            log.index(),
            NodeType::Replica,
            StreamConfig::default(),
        );
        (syncup, replica)
    }

    #[test]
    fn test_locate_recovers_through_gap() {
        let log = log(40, 5);
        // Target 12 lives in file 2; files 3..=5 go away.
        for f in 3..=5 {
            log.clean_file(f);
        }
        let (mut s, _replica) = syncup(&log);
        let record = s.locate(Vlsn::new(12)).unwrap();
        assert_eq!(record.vlsn, Vlsn::new(12));
    }

    #[test]
    fn test_locate_missing_entry_needs_restore() {
        let log = log(40, 5);
        log.clean_file(4);
        let (mut s, _replica) = syncup(&log);
        let err = s.locate(Vlsn::new(22)).unwrap_err();
        assert!(err.requires_network_restore());
    }

    #[test]
    fn test_db_id_and_start_stream() {
        struct Names;
        impl DbIdLookup for Names {
            fn db_id(&self, db_name: &str) -> Option<i64> {
                (db_name == "orders").then_some(7)
            }
        }

        let log = log(10, 5);
        let (s, replica) = syncup(&log);
        let mut s = s.with_db_ids(Arc::new(Names));
        replica
            .send(&Message::DbIdRequest {
                db_name: "orders".into(),
            })
            .unwrap();
        replica
            .send(&Message::DbIdRequest {
                db_name: "missing".into(),
            })
            .unwrap();
        replica
            .send(&Message::EntryRequest {
                vlsn: Vlsn::new(4),
                mode: EntryRequestMode::Default,
            })
            .unwrap();
        replica
            .send(&Message::StartStream {
                vlsn: Vlsn::new(5),
                filter: None,
            })
            .unwrap();

        let outcome = s.run().unwrap();
        assert_eq!(outcome.start, Vlsn::new(5));

        let wait = Duration::from_millis(100);
        assert_eq!(
            replica.receive(wait).unwrap(),
            Some(Message::DbIdResponse {
                db_name: "orders".into(),
                db_id: 7
            })
        );
        assert_eq!(
            replica.receive(wait).unwrap(),
            Some(Message::DbIdResponse {
                db_name: "missing".into(),
                db_id: -1
            })
        );
        match replica.receive(wait).unwrap() {
            Some(Message::Entry { record }) => assert_eq!(record.vlsn, Vlsn::new(4)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unexpected_message_is_protocol_error() {
        let log = log(3, 5);
        let (mut s, replica) = syncup(&log);
        replica.send(&Message::ShutdownResponse).unwrap();
        assert!(matches!(s.run(), Err(Error::Protocol(_))));
    }
}
