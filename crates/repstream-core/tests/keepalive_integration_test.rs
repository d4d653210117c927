//! Keepalives flowing while the feeder walks a long stretch of log
//!
//! The feeder's log is slowed down and its index knows no positions, so
//! locating the replica's matchpoint walks back over the whole log. The
//! replica has to keep answering pings for the syncup to survive.

use bytes::Bytes;
use repstream_core::channel::{Channel, MemoryChannel, TcpChannel};
use repstream_core::keepalive::Keepalive;
use repstream_core::log::{EntryType, LogRecord, LogStore, MemoryIndex, MemoryLog, Step, VlsnIndex};
use repstream_core::matchpoint::{FeederSyncup, LocalLog, ReplicaSyncup};
use repstream_core::protocol::{LocalNode, NodeType, consumer_handshake, feeder_handshake};
use repstream_core::vlsn::{Lsn, VlsnRange};
use repstream_core::{Result, StreamConfig, Vlsn};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

/// Log whose reads each take `delay`
struct SlowLog {
    log: Arc<MemoryLog>,
    delay: Duration,
}

impl LogStore for SlowLog {
    fn read(&self, lsn: Lsn) -> Result<LogRecord> {
        thread::sleep(self.delay);
        LogStore::read(self.log.as_ref(), lsn)
    }

    fn next(&self, lsn: Lsn) -> Step {
        LogStore::next(self.log.as_ref(), lsn)
    }

    fn prev(&self, lsn: Lsn) -> Step {
        LogStore::prev(self.log.as_ref(), lsn)
    }

    fn first_lsn(&self) -> Lsn {
        self.log.first_lsn()
    }

    fn last_lsn(&self) -> Lsn {
        self.log.last_lsn()
    }

    fn buffered(&self, vlsn: Vlsn) -> Option<LogRecord> {
        self.log.buffered(vlsn)
    }
}

/// Index reporting the range but no positions, forcing scans from the tail
struct RangeOnlyIndex(Arc<MemoryIndex>);

impl VlsnIndex for RangeOnlyIndex {
    fn range(&self) -> VlsnRange {
        self.0.range()
    }

    fn lsn_for(&self, _vlsn: Vlsn) -> Option<Lsn> {
        None
    }

    fn lsn_at_or_before(&self, _vlsn: Vlsn) -> Option<(Vlsn, Lsn)> {
        None
    }

    fn lsn_at_or_after(&self, _vlsn: Vlsn) -> Option<(Vlsn, Lsn)> {
        None
    }

    fn await_vlsn(&self, vlsn: Vlsn, wait: Duration) -> bool {
        self.0.await_vlsn(vlsn, wait)
    }
}

fn config() -> StreamConfig {
    StreamConfig {
        feeder_timeout: Duration::from_secs(1),
        keepalive_fraction: 20,
        channel_check_entries: 1,
        max_unanswered_keepalives: 3,
        ..StreamConfig::default()
    }
}

/// Sync a replica holding only the first transaction against 1000 of them
fn sync_over(feeder: Arc<dyn Channel>, replica: Arc<dyn Channel>) {
    let log = Arc::new(MemoryLog::new(64));
    for txn in 1..=1000 {
        log.append(EntryType::Data, Bytes::from(format!("row-{txn}")));
        log.append_commit(txn);
    }
    let local = Arc::new(MemoryLog::new(64));
    for vlsn in 1..=2 {
        local.apply(&log.get(Vlsn::new(vlsn)).unwrap()).unwrap();
    }

    let config = config();
    let keepalive = Keepalive::new(feeder.clone(), &config);
    let feeder_side = {
        let keepalive = keepalive.clone();
        thread::spawn(move || {
            let node = LocalNode::new(1, "feeder", NodeType::Replica);
            let handshake = feeder_handshake(feeder.as_ref(), &node, WAIT)?;
            let store = Arc::new(SlowLog {
                log: log.clone(),
                delay: Duration::from_micros(300),
            });
            let mut syncup = FeederSyncup::new(
                feeder,
                store,
                Arc::new(RangeOnlyIndex(log.index())),
                handshake.peer_type,
                config,
            )
            .with_keepalive(keepalive);
            let outcome = syncup.run()?;
            Ok::<_, repstream_core::Error>((outcome, syncup.entries_scanned()))
        })
    };

    consumer_handshake(
        replica.as_ref(),
        &LocalNode::new(2, "replica", NodeType::Replica),
        WAIT,
    )
    .unwrap();
    let start = ReplicaSyncup::new(replica, local.clone(), NodeType::Replica, WAIT)
        .run()
        .unwrap();

    let (outcome, scanned) = feeder_side.join().unwrap().unwrap();
    assert_eq!(start, Vlsn::new(3));
    assert_eq!(outcome.start, Vlsn::new(3));
    assert!(scanned >= 1999, "scan visited only {scanned} entries");
    assert!(keepalive.sent() >= 3, "only {} keepalives sent", keepalive.sent());
    assert_eq!(local.range().last, Vlsn::new(2));
}

#[test]
fn test_keepalives_answered_during_long_scan_in_memory() {
    let (feeder, replica) = MemoryChannel::pair("feeder", "replica");
    sync_over(Arc::new(feeder), Arc::new(replica));
}

#[test]
fn test_keepalives_answered_during_long_scan_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let replica = TcpChannel::connect(listener.local_addr().unwrap(), "feeder").unwrap();
    let (stream, _) = listener.accept().unwrap();
    let feeder = TcpChannel::new(stream, "replica").unwrap();
    sync_over(Arc::new(feeder), Arc::new(replica));
}
