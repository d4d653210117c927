//! Consumer side of the steady-state stream

use crate::channel::Channel;
use crate::feeder::now_ms;
use crate::log::LogRecord;
use crate::protocol::{FilterStats, Message, SyncPolicy};
use crate::vlsn::Vlsn;
use crate::{Error, Result, TxnId};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// What the feeder sent
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A log entry, with its before-image when the feeder tracks one
    Entry(LogRecord),
    /// A commit the feeder may want acknowledged
    Commit {
        /// The commit entry
        record: LogRecord,
        /// Whether to reply with an ack once applied
        needs_ack: bool,
        /// Local durability for the commit
        sync_policy: SyncPolicy,
    },
    /// Liveness; already answered
    Heartbeat {
        /// Feeder clock in ms
        master_now_ms: i64,
        /// Feeder's newest transaction end
        txn_end_vlsn: Vlsn,
    },
    /// The feeder is going away; already answered
    Shutdown {
        /// When the feeder started shutting down, in ms
        shutdown_time_ms: i64,
    },
}

/// Reads entries from a feeder after syncup
pub struct StreamConsumer {
    channel: Arc<dyn Channel>,
    sync_up_vlsn: Vlsn,
    last_vlsn: Vlsn,
    last_txn_end: Vlsn,
    durable: AtomicI64,
    passed: AtomicI64,
    filtered: AtomicI64,
}

impl StreamConsumer {
    /// Consumer expecting `start` as the first entry
    pub fn new(channel: Arc<dyn Channel>, start: Vlsn) -> Self {
        let matchpoint = start.prev();
        Self {
            channel,
            sync_up_vlsn: matchpoint,
            last_vlsn: matchpoint,
            last_txn_end: Vlsn::NULL,
            durable: AtomicI64::new(matchpoint.sequence()),
            passed: AtomicI64::new(0),
            filtered: AtomicI64::new(0),
        }
    }

    /// Newest sequence number received
    pub fn last_vlsn(&self) -> Vlsn {
        self.last_vlsn
    }

    /// Report entries through `vlsn` durable locally
    pub fn set_durable_vlsn(&self, vlsn: Vlsn) {
        self.durable.fetch_max(vlsn.sequence(), Ordering::AcqRel);
    }

    /// Count one entry against the subscription filter
    pub fn record_filter(&self, passed: bool) {
        if passed {
            self.passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.filtered.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn durable_vlsn(&self) -> Vlsn {
        Vlsn::new(self.durable.load(Ordering::Acquire))
    }

    fn advance(&mut self, record: &LogRecord) -> Result<()> {
        if record.vlsn <= self.last_vlsn {
            return Err(Error::invalid_state(format!(
                "{} sent {} after {}",
                self.channel.peer_name(),
                record.vlsn,
                self.last_vlsn
            )));
        }
        self.last_vlsn = record.vlsn;
        if record.entry_type.is_txn_end() {
            self.last_txn_end = record.vlsn;
        }
        Ok(())
    }

    /// Next stream event, or `None` if nothing arrived within `wait`
    pub fn next_event(&mut self, wait: Duration) -> Result<Option<StreamEvent>> {
        loop {
            let Some(message) = self.channel.receive(wait)? else {
                return Ok(None);
            };
            match message {
                Message::Entry { record } => {
                    let record = LogRecord::from_wire(record);
                    self.advance(&record)?;
                    return Ok(Some(StreamEvent::Entry(record)));
                }
                Message::EntryWithBeforeImage {
                    record,
                    before_image,
                } => {
                    let record = LogRecord::from_wire(record).with_before_image(before_image);
                    self.advance(&record)?;
                    return Ok(Some(StreamEvent::Entry(record)));
                }
                Message::Commit {
                    needs_ack,
                    sync_policy,
                    record,
                } => {
                    let record = LogRecord::from_wire(record);
                    self.advance(&record)?;
                    return Ok(Some(StreamEvent::Commit {
                        record,
                        needs_ack,
                        sync_policy,
                    }));
                }
                Message::Heartbeat {
                    master_now_ms,
                    current_txn_end_vlsn,
                    heartbeat_id,
                } => {
                    self.channel.send(&Message::HeartbeatResponse {
                        sync_up_vlsn: self.sync_up_vlsn,
                        txn_end_vlsn: self.last_txn_end,
                        heartbeat_id,
                        filter_stats: FilterStats {
                            passed: self.passed.load(Ordering::Relaxed),
                            filtered: self.filtered.load(Ordering::Relaxed),
                        },
                        sender_time_ms: now_ms(),
                        local_durable_vlsn: self.durable_vlsn(),
                    })?;
                    debug!(
                        "Answered heartbeat {} from {}",
                        heartbeat_id,
                        self.channel.peer_name()
                    );
                    return Ok(Some(StreamEvent::Heartbeat {
                        master_now_ms,
                        txn_end_vlsn: current_txn_end_vlsn,
                    }));
                }
                Message::ShutdownRequest { shutdown_time_ms } => {
                    self.channel.send(&Message::ShutdownResponse)?;
                    info!(
                        "{} shutting down, stream ended at {}",
                        self.channel.peer_name(),
                        self.last_vlsn
                    );
                    return Ok(Some(StreamEvent::Shutdown { shutdown_time_ms }));
                }
                Message::Keepalive { id } => {
                    self.channel.send(&Message::KeepaliveResponse { id })?;
                }
                other => {
                    return Err(Error::protocol(format!(
                        "Unexpected {:?} from {} in the stream",
                        other.opcode(),
                        self.channel.peer_name()
                    )));
                }
            }
        }
    }

    /// Acknowledge one transaction
    pub fn ack(&self, txn_id: TxnId) -> Result<()> {
        self.channel.send(&Message::Ack {
            txn_id,
            local_durable_vlsn: self.durable_vlsn(),
        })
    }

    /// Acknowledge several transactions in one message
    pub fn group_ack(&self, txn_ids: &[TxnId]) -> Result<()> {
        match txn_ids {
            [] => Ok(()),
            [txn_id] => self.ack(*txn_id),
            _ => self.channel.send(&Message::GroupAck {
                txn_ids: txn_ids.to_vec(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::log::{EntryType, txn_end_payload};
    use crate::protocol::ProtocolContext;
    use bytes::Bytes;

    fn pair() -> (MemoryChannel, StreamConsumer) {
        let (feeder, replica) = MemoryChannel::pair("feeder", "replica");
        feeder.set_context(ProtocolContext::stream(15));
        replica.set_context(ProtocolContext::stream(15));
        (feeder, StreamConsumer::new(Arc::new(replica), Vlsn::new(5)))
    }

    fn entry(vlsn: i64) -> Message {
        Message::Entry {
            record: LogRecord::new(EntryType::Data, 16, Vlsn::new(vlsn), Bytes::from_static(b"x"))
                .to_wire(),
        }
    }

    #[test]
    fn test_rejects_repeated_vlsn() {
        let (feeder, mut consumer) = pair();
        feeder.send(&entry(5)).unwrap();
        feeder.send(&entry(5)).unwrap();
        let wait = Duration::from_millis(100);
        assert!(matches!(
            consumer.next_event(wait).unwrap(),
            Some(StreamEvent::Entry(r)) if r.vlsn == Vlsn::new(5)
        ));
        assert!(matches!(
            consumer.next_event(wait),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_heartbeat_reports_progress() {
        let (feeder, mut consumer) = pair();
        let commit = LogRecord::new(
            EntryType::TxnCommit,
            16,
            Vlsn::new(5),
            txn_end_payload(42, b""),
        );
        feeder
            .send(&Message::Commit {
                needs_ack: true,
                sync_policy: SyncPolicy::Sync,
                record: commit.to_wire(),
            })
            .unwrap();
        feeder
            .send(&Message::Heartbeat {
                master_now_ms: 1,
                current_txn_end_vlsn: Vlsn::new(5),
                heartbeat_id: 9,
            })
            .unwrap();

        let wait = Duration::from_millis(100);
        let Some(StreamEvent::Commit { record, needs_ack, .. }) = consumer.next_event(wait).unwrap()
        else {
            panic!("expected commit");
        };
        assert!(needs_ack);
        consumer.set_durable_vlsn(record.vlsn);
        consumer.ack(record.txn_id().unwrap()).unwrap();
        assert!(matches!(
            consumer.next_event(wait).unwrap(),
            Some(StreamEvent::Heartbeat { .. })
        ));

        assert_eq!(
            feeder.receive(wait).unwrap(),
            Some(Message::Ack {
                txn_id: 42,
                local_durable_vlsn: Vlsn::new(5)
            })
        );
        match feeder.receive(wait).unwrap() {
            Some(Message::HeartbeatResponse {
                txn_end_vlsn,
                heartbeat_id,
                local_durable_vlsn,
                sync_up_vlsn,
                ..
            }) => {
                assert_eq!(txn_end_vlsn, Vlsn::new(5));
                assert_eq!(heartbeat_id, 9);
                assert_eq!(local_durable_vlsn, Vlsn::new(5));
                assert_eq!(sync_up_vlsn, Vlsn::new(4));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_keepalive_answered_inline_and_shutdown() {
        let (feeder, mut consumer) = pair();
        feeder.send(&Message::Keepalive { id: 3 }).unwrap();
        feeder
            .send(&Message::ShutdownRequest {
                shutdown_time_ms: 77,
            })
            .unwrap();
        let event = consumer.next_event(Duration::from_millis(100)).unwrap();
        assert!(matches!(
            event,
            Some(StreamEvent::Shutdown {
                shutdown_time_ms: 77
            })
        ));
        let wait = Duration::from_millis(100);
        assert_eq!(
            feeder.receive(wait).unwrap(),
            Some(Message::KeepaliveResponse { id: 3 })
        );
        assert_eq!(feeder.receive(wait).unwrap(), Some(Message::ShutdownResponse));
    }

    #[test]
    fn test_group_ack_batches() {
        let (feeder, consumer) = pair();
        consumer.group_ack(&[1, 2, 3]).unwrap();
        consumer.group_ack(&[]).unwrap();
        assert_eq!(
            feeder.receive(Duration::from_millis(100)).unwrap(),
            Some(Message::GroupAck {
                txn_ids: vec![1, 2, 3]
            })
        );
        assert_eq!(feeder.receive(Duration::ZERO).unwrap(), None);
    }
}
