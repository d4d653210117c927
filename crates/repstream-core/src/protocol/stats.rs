//! Per-channel protocol counters

use super::message::Message;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated as messages cross a channel
#[derive(Debug, Default)]
pub struct ProtocolStats {
    messages_written: AtomicU64,
    bytes_written: AtomicU64,
    messages_read: AtomicU64,
    bytes_read: AtomicU64,
    acks: AtomicU64,
    group_acks: AtomicU64,
    group_ack_txns: AtomicU64,
    max_group_ack: AtomicU64,
}

/// Point-in-time copy of [`ProtocolStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolStatsSnapshot {
    /// Frames sent
    pub messages_written: u64,
    /// Bytes sent, headers included
    pub bytes_written: u64,
    /// Frames received
    pub messages_read: u64,
    /// Bytes received, headers included
    pub bytes_read: u64,
    /// Single acks seen
    pub acks: u64,
    /// Group acks seen
    pub group_acks: u64,
    /// Transactions covered by group acks
    pub group_ack_txns: u64,
    /// Largest group ack
    pub max_group_ack: u64,
}

impl ProtocolStats {
    /// New zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outgoing frame
    pub fn record_write(&self, message: &Message, frame_len: usize) {
        self.messages_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(frame_len as u64, Ordering::Relaxed);
        self.record_acks(message);
    }

    /// Record an incoming frame
    pub fn record_read(&self, message: &Message, frame_len: usize) {
        self.messages_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(frame_len as u64, Ordering::Relaxed);
        self.record_acks(message);
    }

    fn record_acks(&self, message: &Message) {
        match message {
            Message::Ack { .. } => {
                self.acks.fetch_add(1, Ordering::Relaxed);
            }
            Message::GroupAck { txn_ids } => {
                let n = txn_ids.len() as u64;
                self.group_acks.fetch_add(1, Ordering::Relaxed);
                self.group_ack_txns.fetch_add(n, Ordering::Relaxed);
                self.max_group_ack.fetch_max(n, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Copy the current values
    pub fn snapshot(&self) -> ProtocolStatsSnapshot {
        ProtocolStatsSnapshot {
            messages_written: self.messages_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            messages_read: self.messages_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            group_acks: self.group_acks.load(Ordering::Relaxed),
            group_ack_txns: self.group_ack_txns.load(Ordering::Relaxed),
            max_group_ack: self.max_group_ack.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_counters() {
        let stats = ProtocolStats::new();
        stats.record_write(
            &Message::GroupAck {
                txn_ids: vec![1, 2, 3],
            },
            34,
        );
        stats.record_write(
            &Message::GroupAck { txn_ids: vec![4] },
            18,
        );
        stats.record_read(
            &Message::Ack {
                txn_id: 9,
                local_durable_vlsn: crate::vlsn::Vlsn::NULL,
            },
            14,
        );

        let snap = stats.snapshot();
        assert_eq!(snap.group_acks, 2);
        assert_eq!(snap.group_ack_txns, 4);
        assert_eq!(snap.max_group_ack, 3);
        assert_eq!(snap.acks, 1);
        assert_eq!(snap.bytes_written, 52);
        assert_eq!(snap.messages_read, 1);
    }
}
