//! Matchpoint syncup over in-memory channels
//!
//! Each test runs the feeder half on a spawned thread and the consumer half
//! on the test thread, with every message crossing the wire codec.

use bytes::Bytes;
use repstream_core::channel::{Channel, MemoryChannel};
use repstream_core::log::{EntryType, LogRecord, MemoryLog, VlsnIndex};
use repstream_core::matchpoint::{
    FeederSyncup, LocalLog, ReplicaSyncup, RestorePeers, SubscriberSyncup, SyncupOutcome,
};
use repstream_core::protocol::{
    EntryRequestMode, LocalNode, NodeType, PeerInfo, consumer_handshake, feeder_handshake,
};
use repstream_core::{Error, Result, StreamConfig, Vlsn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct Peers;

impl RestorePeers for Peers {
    fn restore_peers(&self) -> (Vlsn, Vec<PeerInfo>) {
        (
            Vlsn::new(40),
            vec![PeerInfo {
                node_name: "node-c".into(),
                host: "10.0.0.3".into(),
                port: 5001,
            }],
        )
    }
}

/// Feeder log of `txns` transactions, one data entry plus a commit each
fn feeder_log(txns: i64, per_file: usize) -> Arc<MemoryLog> {
    let log = Arc::new(MemoryLog::new(per_file));
    for txn in 1..=txns {
        log.append(EntryType::Data, Bytes::from(format!("row-{txn}")));
        log.append_commit(txn);
    }
    log
}

fn spawn_feeder(
    channel: MemoryChannel,
    log: Arc<MemoryLog>,
) -> JoinHandle<Result<SyncupOutcome>> {
    thread::spawn(move || {
        let channel: Arc<dyn Channel> = Arc::new(channel);
        let local = LocalNode::new(1, "feeder", NodeType::Replica);
        let handshake = feeder_handshake(channel.as_ref(), &local, WAIT)?;
        FeederSyncup::new(
            channel,
            log.clone(),
            log.index(),
            handshake.peer_type,
            StreamConfig::default(),
        )
        .with_restore_peers(Arc::new(Peers))
        .run()
    })
}

fn connect(name: &str) -> (MemoryChannel, Arc<dyn Channel>) {
    let (feeder, consumer) = MemoryChannel::pair("feeder", name);
    let consumer: Arc<dyn Channel> = Arc::new(consumer);
    (feeder, consumer)
}

fn handshake(channel: &Arc<dyn Channel>, node_type: NodeType, name: &str) {
    consumer_handshake(channel.as_ref(), &LocalNode::new(2, name, node_type), WAIT).unwrap();
}

#[test]
fn test_empty_replica_starts_at_first() {
    let log = feeder_log(5, 4);
    let (feeder_side, channel) = connect("replica");
    let feeder = spawn_feeder(feeder_side, log);

    handshake(&channel, NodeType::Replica, "replica");
    let local = Arc::new(MemoryLog::new(4));
    let start = ReplicaSyncup::new(channel, local, NodeType::Replica, WAIT)
        .run()
        .unwrap();

    assert_eq!(start, Vlsn::FIRST);
    assert_eq!(feeder.join().unwrap().unwrap().start, Vlsn::FIRST);
}

#[test]
fn test_divergent_tail_rolled_back_to_common_commit() {
    let log = feeder_log(3, 4);
    let replica = Arc::new(MemoryLog::new(4));
    for vlsn in 1..=4 {
        let record = log.get(Vlsn::new(vlsn)).unwrap();
        replica.apply(&record).unwrap();
    }
    // Entries 5 and 6 were written under a leader that lost its election.
    replica.append(EntryType::Data, Bytes::from_static(b"orphan"));
    replica.append_commit(77);

    let (feeder_side, channel) = connect("replica");
    let feeder = spawn_feeder(feeder_side, log);
    handshake(&channel, NodeType::Replica, "replica");

    let mut syncup = ReplicaSyncup::new(channel, replica.clone(), NodeType::Replica, WAIT);
    let start = syncup.run().unwrap();

    assert_eq!(start, Vlsn::new(5));
    assert_eq!(syncup.probes(), 2);
    assert_eq!(replica.range().last, Vlsn::new(4));
    assert!(replica.record(Vlsn::new(5)).is_none());
    assert_eq!(feeder.join().unwrap().unwrap().start, Vlsn::new(5));
}

#[test]
fn test_replica_behind_cleaned_log_needs_restore() {
    let log = feeder_log(10, 5);
    assert!(log.clean_file(0));
    assert!(log.clean_file(1));

    let (feeder_side, channel) = connect("replica");
    let feeder = spawn_feeder(feeder_side, log);
    handshake(&channel, NodeType::Replica, "replica");

    let replica = Arc::new(MemoryLog::new(5));
    replica.append(EntryType::Data, Bytes::from_static(b"old"));
    replica.append_commit(1);

    let err = ReplicaSyncup::new(channel, replica, NodeType::Replica, WAIT)
        .run()
        .unwrap_err();
    match err {
        Error::NetworkRestoreRequired { peers, .. } => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].node_name, "node-c");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(feeder.join().unwrap().unwrap_err().requires_network_restore());
}

#[test]
fn test_arbiter_starts_after_feeder_tip() {
    let log = feeder_log(4, 4);
    let (feeder_side, channel) = connect("arbiter");
    let feeder = spawn_feeder(feeder_side, log);
    handshake(&channel, NodeType::Arbiter, "arbiter");

    let local = Arc::new(MemoryLog::new(4));
    let start = ReplicaSyncup::new(channel, local, NodeType::Arbiter, WAIT)
        .run()
        .unwrap();
    assert_eq!(start, Vlsn::new(9));
    feeder.join().unwrap().unwrap();
}

#[test]
fn test_subscriber_clamped_to_available_range() {
    let log = feeder_log(10, 5);
    log.clean_file(0);
    let first = log.index().range().first;

    let (feeder_side, channel) = connect("subscriber");
    let feeder = spawn_feeder(feeder_side, log);
    handshake(&channel, NodeType::Subscriber, "subscriber");

    let filter = Bytes::from_static(b"db=orders");
    let mut syncup =
        SubscriberSyncup::new(channel, Vlsn::FIRST, EntryRequestMode::Available, WAIT)
            .with_filter(filter.clone());
    assert_eq!(syncup.request_db_id("orders").unwrap(), None);
    let start = syncup.run().unwrap();

    assert_eq!(start, first);
    let outcome = feeder.join().unwrap().unwrap();
    assert_eq!(outcome.start, first);
    assert_eq!(outcome.filter, Some(filter));
}

#[test]
fn test_cleaning_below_matchpoint_is_harmless() {
    let log = Arc::new(MemoryLog::with_index_stride(4, 1000));
    for txn in 1..=12 {
        log.append(EntryType::Data, Bytes::from(format!("row-{txn}")));
        log.append_commit(txn);
    }
    let replica = Arc::new(MemoryLog::new(4));
    for vlsn in 1..=14 {
        replica.apply(&log.get(Vlsn::new(vlsn)).unwrap()).unwrap();
    }
    log.clean_file(1);

    let (feeder_side, channel) = connect("replica");
    let feeder = spawn_feeder(feeder_side, log);
    handshake(&channel, NodeType::Replica, "replica");

    let start = ReplicaSyncup::new(channel, replica, NodeType::Replica, WAIT)
        .run()
        .unwrap();
    assert_eq!(start, Vlsn::new(15));
    feeder.join().unwrap().unwrap();
}

#[test]
fn test_remote_record_matches_local_copy() {
    let log = feeder_log(1, 4);
    let local = log.get(Vlsn::new(2)).unwrap();
    let remote = LogRecord::from_wire(local.to_wire());
    assert!(local.matches(&remote));
}
