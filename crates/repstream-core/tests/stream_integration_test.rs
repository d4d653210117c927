//! Feeder sessions streaming to replicas and arbiters

use bytes::Bytes;
use repstream_core::acks::{AckMode, AckTracker, CommitTxn};
use repstream_core::channel::{Channel, MemoryChannel};
use repstream_core::consumer::{StreamConsumer, StreamEvent};
use repstream_core::feeder::{Feeder, FeederStats};
use repstream_core::leader::{LeaderId, LeaderStatusTracker, Proposal};
use repstream_core::log::{EntryType, LogRecord, MemoryLog, txn_end_payload};
use repstream_core::matchpoint::{LocalLog, ReplicaSyncup};
use repstream_core::protocol::{LocalNode, NodeType, consumer_handshake};
use repstream_core::{Error, Result, StreamConfig, Vlsn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn leader() -> Arc<LeaderStatusTracker> {
    let tracker = Arc::new(LeaderStatusTracker::new(1));
    tracker.set_group_leader(LeaderId::new("feeder", 5001, 1), Proposal(1));
    tracker.sync();
    tracker
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("repstream_core=debug")
        .with_test_writer()
        .try_init();
}

fn config() -> StreamConfig {
    StreamConfig::default()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_feeder_timeout(WAIT)
}

struct Session {
    feeder: JoinHandle<Result<FeederStats>>,
    handle: repstream_core::FeederHandle,
    consumer: Arc<dyn Channel>,
}

fn start_feeder(
    log: &Arc<MemoryLog>,
    acks: &Arc<AckTracker>,
    leader: &Arc<LeaderStatusTracker>,
    consumer_name: &str,
) -> Session {
    init_tracing();
    let (feeder_side, consumer) = MemoryChannel::pair("feeder", consumer_name);
    let feeder = Feeder::new(
        Arc::new(feeder_side),
        LocalNode::new(1, "feeder", NodeType::Replica),
        log.clone(),
        log.index(),
        config(),
        acks.clone(),
        leader.clone(),
    );
    let handle = feeder.handle();
    Session {
        feeder: thread::spawn(move || feeder.run()),
        handle,
        consumer: Arc::new(consumer),
    }
}

/// Apply entries until shutdown, acking commits that ask for it
fn run_replica(channel: Arc<dyn Channel>, local: Arc<MemoryLog>) -> Result<u64> {
    consumer_handshake(
        channel.as_ref(),
        &LocalNode::new(2, "replica", NodeType::Replica),
        WAIT,
    )?;
    let start = ReplicaSyncup::new(channel.clone(), local.clone(), NodeType::Replica, WAIT).run()?;
    let mut consumer = StreamConsumer::new(channel, start);
    let mut applied = 0;
    loop {
        match consumer.next_event(WAIT)? {
            Some(StreamEvent::Entry(record)) => {
                local.apply(&record)?;
                applied += 1;
            }
            Some(StreamEvent::Commit {
                record, needs_ack, ..
            }) => {
                local.apply(&record)?;
                consumer.set_durable_vlsn(record.vlsn);
                if needs_ack {
                    if let Some(txn_id) = record.txn_id() {
                        consumer.ack(txn_id)?;
                    }
                }
                applied += 1;
            }
            Some(StreamEvent::Heartbeat { .. }) => {}
            Some(StreamEvent::Shutdown { .. }) => return Ok(applied),
            None => return Err(Error::sync_failed("stream stalled")),
        }
    }
}

fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_replica_streams_and_acks_commit() {
    let log = Arc::new(MemoryLog::new(8));
    for txn in 1..=5 {
        log.append(EntryType::Data, Bytes::from(format!("row-{txn}")));
        log.append_commit(txn);
    }
    log.flush();

    let acks = Arc::new(AckTracker::new(Duration::from_millis(10)));
    let session = start_feeder(&log, &acks, &leader(), "replica");
    let replica_log = Arc::new(MemoryLog::new(8));
    let replica = {
        let channel = session.consumer.clone();
        let local = replica_log.clone();
        thread::spawn(move || run_replica(channel, local))
    };

    let commit = CommitTxn::new(6, Vlsn::new(12), 1, WAIT);
    acks.register_for_ack(&commit, AckMode::Sync).unwrap();
    log.append_with_before_image(Bytes::from_static(b"row-6"), Bytes::from_static(b"row-6-old"));
    assert_eq!(log.append_commit(6), Vlsn::new(12));

    acks.await_acks(&commit, WAIT).unwrap();
    wait_for(|| replica_log.range().last == Vlsn::new(12));

    session.handle.shutdown();
    assert_eq!(replica.join().unwrap().unwrap(), 12);
    let stats = session.feeder.join().unwrap().unwrap();

    assert_eq!(stats.peer, "replica");
    assert_eq!(stats.start_vlsn, 1);
    assert_eq!(stats.last_sent_vlsn, 12);
    assert_eq!(stats.entries_sent, 12);
    assert_eq!(stats.commits_sent, 1);
    assert_eq!(stats.acks_received, 1);
    assert_eq!(acks.stats().acked, 1);

    let applied = replica_log.record(Vlsn::new(11)).unwrap();
    assert_eq!(applied.before_image, Some(Bytes::from_static(b"row-6-old")));
}

#[test]
fn test_leader_change_ends_stream() {
    let log = Arc::new(MemoryLog::new(8));
    log.append(EntryType::Data, Bytes::from_static(b"row"));
    log.append_commit(1);

    let acks = Arc::new(AckTracker::new(Duration::from_millis(10)));
    let leader = leader();
    let session = start_feeder(&log, &acks, &leader, "replica");
    let replica_log = Arc::new(MemoryLog::new(8));
    let replica = {
        let channel = session.consumer.clone();
        let local = replica_log.clone();
        thread::spawn(move || run_replica(channel, local))
    };

    wait_for(|| replica_log.range().last == Vlsn::new(2));
    leader.set_group_leader(LeaderId::new("other", 5001, 3), Proposal(2));

    let err = session.feeder.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::LeaderObsolete { .. }));
    // The feeder tears the connection down, so the replica fails too.
    assert!(replica.join().unwrap().is_err());
    assert!(!session.handle.is_running());
}

#[test]
fn test_arbiter_receives_only_queued_commits() {
    let log = Arc::new(MemoryLog::new(8));
    for txn in 1..=3 {
        log.append(EntryType::Data, Bytes::from_static(b"row"));
        log.append_commit(txn);
    }

    let acks = Arc::new(AckTracker::new(Duration::from_millis(10)));
    let session = start_feeder(&log, &acks, &leader(), "arbiter");
    let channel = session.consumer.clone();

    consumer_handshake(
        channel.as_ref(),
        &LocalNode::new(3, "arbiter", NodeType::Arbiter),
        WAIT,
    )
    .unwrap();
    let local = Arc::new(MemoryLog::new(8));
    let start = ReplicaSyncup::new(channel.clone(), local, NodeType::Arbiter, WAIT)
        .run()
        .unwrap();
    assert_eq!(start, Vlsn::new(7));

    let commit = CommitTxn::new(4, Vlsn::new(8), 1, WAIT);
    acks.register_for_ack(&commit, AckMode::Sync).unwrap();
    let record = LogRecord::new(EntryType::TxnCommit, 16, Vlsn::new(8), txn_end_payload(4, b""));
    assert!(session.handle.arbiter_feed().offer_commit(record));

    let mut consumer = StreamConsumer::new(channel, start);
    let record = loop {
        match consumer.next_event(WAIT).unwrap() {
            Some(StreamEvent::Commit { record, needs_ack, .. }) => {
                assert!(needs_ack);
                break record;
            }
            Some(StreamEvent::Heartbeat { .. }) => continue,
            other => panic!("unexpected {other:?}"),
        }
    };
    assert_eq!(record.vlsn, Vlsn::new(8));
    consumer.ack(4).unwrap();
    acks.await_acks(&commit, WAIT).unwrap();

    session.handle.shutdown();
    loop {
        match consumer.next_event(WAIT).unwrap() {
            Some(StreamEvent::Shutdown { .. }) => break,
            Some(StreamEvent::Heartbeat { .. }) => continue,
            other => panic!("unexpected {other:?}"),
        }
    }
    let stats = session.feeder.join().unwrap().unwrap();
    assert_eq!(stats.entries_sent, 1);
}

#[test]
fn test_heartbeats_reach_idle_replica() {
    let log = Arc::new(MemoryLog::new(8));
    log.append_commit(1);

    let acks = Arc::new(AckTracker::new(Duration::from_millis(10)));
    let session = start_feeder(&log, &acks, &leader(), "replica");
    let channel = session.consumer.clone();
    consumer_handshake(
        channel.as_ref(),
        &LocalNode::new(2, "replica", NodeType::Replica),
        WAIT,
    )
    .unwrap();
    let local = Arc::new(MemoryLog::new(8));
    let start = ReplicaSyncup::new(channel.clone(), local, NodeType::Replica, WAIT)
        .run()
        .unwrap();

    let mut consumer = StreamConsumer::new(channel, start);
    let mut heartbeats = 0;
    while heartbeats < 3 {
        match consumer.next_event(WAIT).unwrap() {
            Some(StreamEvent::Heartbeat { txn_end_vlsn, .. }) => {
                assert_eq!(txn_end_vlsn, Vlsn::new(1));
                heartbeats += 1;
            }
            Some(StreamEvent::Entry(record)) => assert_eq!(record.vlsn, Vlsn::FIRST),
            other => panic!("unexpected {other:?}"),
        }
    }

    wait_for(|| session.handle.stats().heartbeat_responses >= 3);
    session.handle.shutdown();
    while !matches!(
        consumer.next_event(WAIT).unwrap(),
        Some(StreamEvent::Shutdown { .. })
    ) {}
    let stats = session.feeder.join().unwrap().unwrap();
    assert!(stats.heartbeats_sent >= 3);
    assert_eq!(stats.consumer_txn_end_vlsn, 1);
}
