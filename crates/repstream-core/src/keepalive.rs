//! Liveness pings during long log scans
//!
//! A matchpoint search may walk a long stretch of log before it can answer
//! the consumer. While it does, the scan periodically checks that the
//! channel is still open and sends `Keepalive` messages so the peer's idle
//! timeout does not fire.

use crate::channel::Channel;
use crate::config::StreamConfig;
use crate::log::ScanMonitor;
use crate::protocol::Message;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct Shared {
    channel: Arc<dyn Channel>,
    interval: Duration,
    check_every: u64,
    max_unanswered: i64,
    last_sent_id: AtomicI64,
    last_answered_id: AtomicI64,
    last_sent_at: Mutex<Instant>,
    sent: AtomicU64,
}

/// Keepalive state for one session
#[derive(Clone)]
pub struct Keepalive {
    shared: Arc<Shared>,
}

impl Keepalive {
    /// Keepalive paced by `config`
    pub fn new(channel: Arc<dyn Channel>, config: &StreamConfig) -> Self {
        Self::with_params(
            channel,
            config.keepalive_interval(),
            config.channel_check_entries,
            config.max_unanswered_keepalives,
        )
    }

    /// Keepalive with explicit pacing
    pub fn with_params(
        channel: Arc<dyn Channel>,
        interval: Duration,
        check_every: u32,
        max_unanswered: u32,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                interval,
                check_every: u64::from(check_every.max(1)),
                max_unanswered: i64::from(max_unanswered),
                last_sent_id: AtomicI64::new(0),
                last_answered_id: AtomicI64::new(0),
                last_sent_at: Mutex::new(Instant::now()),
                sent: AtomicU64::new(0),
            }),
        }
    }

    /// Called per scanned entry; checks and pings every `check_every` entries
    pub fn tick(&self, entries_scanned: u64) -> Result<()> {
        let s = &self.shared;
        if entries_scanned % s.check_every != 0 {
            return Ok(());
        }
        if !s.channel.is_open() {
            return Err(Error::sync_failed(format!(
                "Channel to {} closed during scan after {} entries",
                s.channel.peer_name(),
                entries_scanned
            )));
        }
        self.drain()?;

        let mut last_sent_at = s.last_sent_at.lock();
        if last_sent_at.elapsed() < s.interval {
            return Ok(());
        }
        if self.outstanding() >= s.max_unanswered {
            warn!(
                "{} unanswered keepalives to {}, giving up",
                self.outstanding(),
                s.channel.peer_name()
            );
            return Err(Error::sync_failed(format!(
                "{} did not answer {} keepalives",
                s.channel.peer_name(),
                self.outstanding()
            )));
        }
        let id = s.last_sent_id.fetch_add(1, Ordering::AcqRel) + 1;
        s.channel
            .send(&Message::Keepalive { id })
            .map_err(|e| Error::sync_failed(format!("Keepalive send failed: {}", e)))?;
        s.sent.fetch_add(1, Ordering::Relaxed);
        *last_sent_at = Instant::now();
        debug!("Sent keepalive {} to {}", id, s.channel.peer_name());
        Ok(())
    }

    fn drain(&self) -> Result<()> {
        let s = &self.shared;
        while let Some(message) = s.channel.receive(Duration::ZERO)? {
            match message {
                Message::KeepaliveResponse { id } => self.note_response(id),
                other => {
                    return Err(Error::protocol(format!(
                        "Unexpected {:?} from {} during scan",
                        other.opcode(),
                        s.channel.peer_name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Record a `KeepaliveResponse`
    pub fn note_response(&self, id: i64) {
        self.shared
            .last_answered_id
            .fetch_max(id, Ordering::AcqRel);
    }

    /// Keepalives sent but not yet answered
    pub fn outstanding(&self) -> i64 {
        self.shared.last_sent_id.load(Ordering::Acquire)
            - self.shared.last_answered_id.load(Ordering::Acquire)
    }

    /// Keepalives sent so far
    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::Relaxed)
    }

    /// Scan monitor driving this keepalive
    pub fn monitor(&self) -> KeepaliveMonitor {
        KeepaliveMonitor {
            keepalive: self.clone(),
        }
    }
}

/// [`ScanMonitor`] adapter for [`Keepalive`]
pub struct KeepaliveMonitor {
    keepalive: Keepalive,
}

impl ScanMonitor for KeepaliveMonitor {
    fn on_entry(&mut self, entries_scanned: u64) -> Result<()> {
        self.keepalive.tick(entries_scanned)
    }
}
