//! Record supply for the feeder output loop
//!
//! Lookups try the shared item cache, then the log write buffers, then a
//! forward scan over the log files. When the consumer only accepts durable
//! entries, a record is held back until the durability gate passes it.

use super::cache::LogItemCache;
use crate::log::{LogRecord, LogScanner, LogStore, ScanMonitor, VlsnIndex};
use crate::vlsn::Vlsn;
use crate::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Source of the group-wide durable sequence number
pub trait DurabilityGate: Send + Sync {
    /// Newest entry made durable by the group
    fn durable_vlsn(&self) -> Vlsn;

    /// Block until `vlsn` is durable or `wait` elapses
    fn await_durable(&self, vlsn: Vlsn, wait: Duration) -> bool;
}

/// Settable durable point; stands in for the quorum tracking of a node
#[derive(Debug)]
pub struct DurableVlsn {
    vlsn: Mutex<Vlsn>,
    advanced: Condvar,
}

impl DurableVlsn {
    /// Start at `vlsn`
    pub fn new(vlsn: Vlsn) -> Self {
        Self {
            vlsn: Mutex::new(vlsn),
            advanced: Condvar::new(),
        }
    }

    /// Move the durable point forward; lower values are ignored
    pub fn advance(&self, vlsn: Vlsn) {
        let mut current = self.vlsn.lock();
        if vlsn > *current {
            *current = vlsn;
            drop(current);
            self.advanced.notify_all();
        }
    }
}

impl DurabilityGate for DurableVlsn {
    fn durable_vlsn(&self) -> Vlsn {
        *self.vlsn.lock()
    }

    fn await_durable(&self, vlsn: Vlsn, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        let mut current = self.vlsn.lock();
        while *current < vlsn {
            if self.advanced.wait_until(&mut current, deadline).timed_out() {
                return *current >= vlsn;
            }
        }
        true
    }
}

/// Where records came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedSourceStats {
    /// Served from the item cache
    pub cache_hits: u64,
    /// Served from the write buffers
    pub buffer_hits: u64,
    /// Served by the scanner
    pub disk_reads: u64,
    /// Lookups that timed out
    pub timeouts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cache_hits: AtomicU64,
    buffer_hits: AtomicU64,
    disk_reads: AtomicU64,
    timeouts: AtomicU64,
}

/// Per-session record supplier
pub struct FeedSource {
    store: Arc<dyn LogStore>,
    cache: Option<Arc<LogItemCache>>,
    gate: Option<Arc<dyn DurabilityGate>>,
    scanner: LogScanner,
    replay: Option<LogRecord>,
    counters: Counters,
}

impl FeedSource {
    /// Source positioned to serve `start` first
    pub fn new(store: Arc<dyn LogStore>, index: Arc<dyn VlsnIndex>, start: Vlsn) -> Result<Self> {
        let mut scanner = LogScanner::new(store.clone(), index);
        scanner.init_forward(start)?;
        Ok(Self {
            store,
            cache: None,
            gate: None,
            scanner,
            replay: None,
            counters: Counters::default(),
        })
    }

    /// Serve from a shared item cache first
    pub fn with_cache(mut self, cache: Arc<LogItemCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Only hand out entries the gate reports durable
    pub fn with_durability_gate(mut self, gate: Arc<dyn DurabilityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Warn about slow disk scans
    pub fn with_slow_scan_warning(mut self, threshold: Duration) -> Self {
        self.scanner = self.scanner.with_slow_scan_warning(threshold);
        self
    }

    /// Per-entry scan monitor for the disk path
    pub fn with_monitor(mut self, monitor: Box<dyn ScanMonitor>) -> Self {
        self.scanner = self.scanner.with_monitor(monitor);
        self
    }

    /// Fetch `vlsn`, waiting up to `wait`; `Ok(None)` when not yet available
    pub fn get_record(
        &mut self,
        vlsn: Vlsn,
        wait: Duration,
        include_before_image: bool,
    ) -> Result<Option<LogRecord>> {
        if let Some(held) = self.replay.take() {
            if held.vlsn == vlsn {
                return self.release_when_durable(held, wait, include_before_image);
            }
            debug!("Discarding held record {} for request {}", held.vlsn, vlsn);
        }

        let Some(record) = self.fetch(vlsn, wait)? else {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        self.release_when_durable(record, wait, include_before_image)
    }

    fn release_when_durable(
        &mut self,
        record: LogRecord,
        wait: Duration,
        include_before_image: bool,
    ) -> Result<Option<LogRecord>> {
        if let Some(gate) = &self.gate {
            if gate.durable_vlsn() < record.vlsn && !gate.await_durable(record.vlsn, wait) {
                self.replay = Some(record);
                return Ok(None);
            }
        }
        let mut record = record;
        if !include_before_image {
            record.before_image = None;
        }
        Ok(Some(record))
    }

    fn fetch(&mut self, vlsn: Vlsn, wait: Duration) -> Result<Option<LogRecord>> {
        if let Some(cache) = &self.cache {
            if let Some(item) = cache.get(vlsn) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.scanner.note_cache_hit(vlsn);
                return Ok(Some(LogRecord::from_cached(item)));
            }
        }
        if let Some(record) = self.store.buffered(vlsn) {
            self.counters.buffer_hits.fetch_add(1, Ordering::Relaxed);
            self.scanner.note_cache_hit(vlsn);
            return Ok(Some(record));
        }
        let record = self.scanner.scan_forward(vlsn, wait)?;
        if record.is_some() {
            self.counters.disk_reads.fetch_add(1, Ordering::Relaxed);
        }
        Ok(record)
    }

    /// Sequence number of a record held back by the durability gate
    pub fn held(&self) -> Option<Vlsn> {
        self.replay.as_ref().map(|r| r.vlsn)
    }

    /// Drop a held record, releasing any cache reference
    pub fn release(&mut self) {
        self.replay = None;
    }

    /// Entries visited by the disk path
    pub fn entries_scanned(&self) -> u64 {
        self.scanner.entries_scanned()
    }

    /// Current counters
    pub fn stats(&self) -> FeedSourceStats {
        FeedSourceStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            buffer_hits: self.counters.buffer_hits.load(Ordering::Relaxed),
            disk_reads: self.counters.disk_reads.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{EntryType, MemoryLog};
    use bytes::Bytes;

    fn filled(entries: i64) -> (Arc<MemoryLog>, Arc<LogItemCache>) {
        let cache = Arc::new(LogItemCache::new(4));
        let log = Arc::new(MemoryLog::new(8).with_item_cache(cache.clone()));
        for i in 0..entries {
            log.append(EntryType::Data, Bytes::from(format!("v{i}")));
        }
        (log, cache)
    }

    #[test]
    fn test_tiers() {
        let (log, cache) = filled(10);
        log.flush();
        let mut source = FeedSource::new(log.clone(), log.index(), Vlsn::FIRST)
            .unwrap()
            .with_cache(cache);

        for v in 1..=10 {
            let record = source
                .get_record(Vlsn::new(v), Duration::ZERO, false)
                .unwrap()
                .unwrap();
            assert_eq!(record.vlsn, Vlsn::new(v));
            assert_eq!(record.payload.is_cached(), v > 6);
        }
        let stats = source.stats();
        assert_eq!(stats.disk_reads, 6);
        assert_eq!(stats.cache_hits, 4);
        assert_eq!(stats.buffer_hits, 0);
    }

    #[test]
    fn test_write_buffer_tier() {
        let (log, _) = filled(3);
        let mut source = FeedSource::new(log.clone(), log.index(), Vlsn::FIRST).unwrap();
        let record = source.get_record(Vlsn::FIRST, Duration::ZERO, false).unwrap();
        assert!(record.is_some());
        assert_eq!(source.stats().buffer_hits, 1);
    }

    #[test]
    fn test_timeout_when_not_written() {
        let (log, _) = filled(2);
        log.flush();
        let mut source = FeedSource::new(log.clone(), log.index(), Vlsn::new(3)).unwrap();
        let got = source
            .get_record(Vlsn::new(3), Duration::from_millis(10), false)
            .unwrap();
        assert!(got.is_none());
        assert_eq!(source.stats().timeouts, 1);
    }

    #[test]
    fn test_durability_gate_holds_record() {
        let (log, cache) = filled(5);
        let gate = Arc::new(DurableVlsn::new(Vlsn::new(3)));
        let mut source = FeedSource::new(log.clone(), log.index(), Vlsn::new(3))
            .unwrap()
            .with_cache(cache)
            .with_durability_gate(gate.clone());

        assert!(source.get_record(Vlsn::new(3), Duration::ZERO, false).unwrap().is_some());
        assert!(source.get_record(Vlsn::new(4), Duration::from_millis(5), false).unwrap().is_none());
        assert_eq!(source.held(), Some(Vlsn::new(4)));

        gate.advance(Vlsn::new(4));
        let record = source.get_record(Vlsn::new(4), Duration::ZERO, false).unwrap().unwrap();
        assert_eq!(record.vlsn, Vlsn::new(4));
        assert_eq!(source.held(), None);
    }

    #[test]
    fn test_release_drops_cache_reference() {
        let (log, cache) = filled(5);
        let gate = Arc::new(DurableVlsn::new(Vlsn::NULL));
        let mut source = FeedSource::new(log.clone(), log.index(), Vlsn::new(5))
            .unwrap()
            .with_cache(cache.clone())
            .with_durability_gate(gate);

        assert!(source.get_record(Vlsn::new(5), Duration::ZERO, false).unwrap().is_none());
        let item = cache.get(Vlsn::new(5)).unwrap();
        assert_eq!(item.use_count(), 2);
        source.release();
        assert_eq!(item.use_count(), 1);
    }

    #[test]
    fn test_before_image_stripped_unless_requested() {
        let log = Arc::new(MemoryLog::new(8));
        log.append_with_before_image(Bytes::from_static(b"new"), Bytes::from_static(b"old"));
        let mut source = FeedSource::new(log.clone(), log.index(), Vlsn::FIRST).unwrap();
        let record = source.get_record(Vlsn::FIRST, Duration::ZERO, false).unwrap().unwrap();
        assert!(record.before_image.is_none());

        let mut source = FeedSource::new(log.clone(), log.index(), Vlsn::FIRST).unwrap();
        let record = source.get_record(Vlsn::FIRST, Duration::ZERO, true).unwrap().unwrap();
        assert_eq!(record.before_image.as_deref(), Some(&b"old"[..]));
    }
}
