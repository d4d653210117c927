//! In-memory log and index
//!
//! Reference implementations of [`LogStore`], [`VlsnIndex`] and
//! [`LocalLog`] used to embed the engine without a storage engine and to
//! drive tests. They model log files, cleaning gaps, rolled back (invisible)
//! entries and a sparse index; the physical offset of an entry is its
//! ordinal within its file.

use super::index::VlsnIndex;
use super::record::{EntryType, LogRecord, txn_end_payload};
use super::store::{LogStore, Step};
use crate::feed::cache::{LogItem, LogItemCache};
use crate::matchpoint::LocalLog;
use crate::protocol::version::CURRENT_LOG_VERSION;
use crate::vlsn::{Lsn, Vlsn, VlsnRange};
use crate::{Error, Result, TxnId};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredEntry {
    entry_type: EntryType,
    version: u8,
    vlsn: Vlsn,
    invisible: bool,
    payload: Bytes,
    before_image: Option<Bytes>,
}

impl StoredEntry {
    fn to_record(&self, lsn: Lsn) -> LogRecord {
        LogRecord {
            entry_type: self.entry_type,
            version: self.version,
            vlsn: self.vlsn,
            lsn,
            invisible: self.invisible,
            payload: super::record::RecordPayload::Owned(self.payload.clone()),
            before_image: self.before_image.clone(),
        }
    }
}

struct LogFiles {
    files: BTreeMap<u32, Vec<StoredEntry>>,
    current: u32,
    last_vlsn: Vlsn,
    flushed_through: Vlsn,
}

impl LogFiles {
    fn first_in(&self, from: u32) -> Option<Lsn> {
        self.files
            .range(from..)
            .find(|(_, entries)| !entries.is_empty())
            .map(|(&file, _)| Lsn::new(file, 0))
    }

    fn last_in(&self, through: u32) -> Option<Lsn> {
        self.files
            .range(..=through)
            .rev()
            .find(|(_, entries)| !entries.is_empty())
            .map(|(&file, entries)| Lsn::new(file, (entries.len() - 1) as u32))
    }

    fn entry(&self, lsn: Lsn) -> Option<&StoredEntry> {
        self.files
            .get(&lsn.file_number())?
            .get(lsn.file_offset() as usize)
    }

    fn find(&self, vlsn: Vlsn) -> Option<(Lsn, &StoredEntry)> {
        self.files.iter().find_map(|(&file, entries)| {
            entries
                .iter()
                .position(|e| e.vlsn == vlsn)
                .map(|pos| (Lsn::new(file, pos as u32), &entries[pos]))
        })
    }

    fn entries(&self) -> impl DoubleEndedIterator<Item = (Lsn, &StoredEntry)> {
        self.files.iter().flat_map(|(&file, entries)| {
            entries
                .iter()
                .enumerate()
                .map(move |(pos, e)| (Lsn::new(file, pos as u32), e))
        })
    }

    fn compute_range(&self) -> VlsnRange {
        let mut range = VlsnRange::empty();
        for (_, entry) in self.entries() {
            if range.first.is_null() {
                range.first = entry.vlsn;
            }
            range.last = entry.vlsn;
            if !entry.invisible {
                if entry.entry_type.is_sync_point() {
                    range.last_sync = entry.vlsn;
                }
                if entry.entry_type.is_txn_end() {
                    range.last_txn_end = entry.vlsn;
                }
            }
        }
        range
    }
}

/// Append-only log kept in memory, split into numbered files
pub struct MemoryLog {
    inner: RwLock<LogFiles>,
    entries_per_file: usize,
    index: Arc<MemoryIndex>,
    cache: Option<Arc<LogItemCache>>,
    log_version: u8,
}

impl MemoryLog {
    /// Log with every entry indexed
    pub fn new(entries_per_file: usize) -> Self {
        Self::with_index_stride(entries_per_file, 1)
    }

    /// Log whose index maps only every `stride`-th entry, file starts and
    /// sync points
    pub fn with_index_stride(entries_per_file: usize, stride: u32) -> Self {
        Self {
            inner: RwLock::new(LogFiles {
                files: BTreeMap::from([(0, Vec::new())]),
                current: 0,
                last_vlsn: Vlsn::NULL,
                flushed_through: Vlsn::NULL,
            }),
            entries_per_file: entries_per_file.max(1),
            index: Arc::new(MemoryIndex::new(stride)),
            cache: None,
            log_version: CURRENT_LOG_VERSION,
        }
    }

    /// Publish appended entries to a shared item cache
    pub fn with_item_cache(mut self, cache: Arc<LogItemCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Write entries with this format version
    pub fn with_log_version(mut self, version: u8) -> Self {
        self.log_version = version;
        self
    }

    /// Index over this log
    pub fn index(&self) -> Arc<MemoryIndex> {
        self.index.clone()
    }

    /// Append an entry with the next sequence number
    pub fn append(&self, entry_type: EntryType, payload: Bytes) -> Vlsn {
        self.append_entry(entry_type, self.log_version, None, payload, None)
    }

    /// Append a commit for `txn_id`
    pub fn append_commit(&self, txn_id: TxnId) -> Vlsn {
        self.append(EntryType::TxnCommit, txn_end_payload(txn_id, b""))
    }

    /// Append a data entry carrying a before-image
    pub fn append_with_before_image(&self, payload: Bytes, before_image: Bytes) -> Vlsn {
        self.append_entry(
            EntryType::Data,
            self.log_version,
            None,
            payload,
            Some(before_image),
        )
    }

    /// Append an entry received from a feeder, keeping its sequence number
    pub fn apply(&self, record: &LogRecord) -> Result<()> {
        let last = self.inner.read().last_vlsn;
        if record.vlsn <= last {
            return Err(Error::invalid_state(format!(
                "Applying entry {} at or below local last {}",
                record.vlsn, last
            )));
        }
        self.append_entry(
            record.entry_type,
            record.version,
            Some(record.vlsn),
            record.payload.to_bytes(),
            record.before_image.clone(),
        );
        Ok(())
    }

    fn append_entry(
        &self,
        entry_type: EntryType,
        version: u8,
        vlsn: Option<Vlsn>,
        payload: Bytes,
        before_image: Option<Bytes>,
    ) -> Vlsn {
        let mut inner = self.inner.write();
        let vlsn = vlsn.unwrap_or_else(|| {
            if inner.last_vlsn.is_null() {
                Vlsn::FIRST
            } else {
                inner.last_vlsn.next()
            }
        });

        let full = inner
            .files
            .get(&inner.current)
            .is_some_and(|entries| entries.len() >= self.entries_per_file);
        if full {
            inner.current += 1;
            let current = inner.current;
            inner.files.insert(current, Vec::new());
        }
        let current = inner.current;
        let entries = inner.files.entry(current).or_default();
        let lsn = Lsn::new(current, entries.len() as u32);
        let file_start = entries.is_empty();
        entries.push(StoredEntry {
            entry_type,
            version,
            vlsn,
            invisible: false,
            payload: payload.clone(),
            before_image: before_image.clone(),
        });
        inner.last_vlsn = vlsn;

        if let Some(cache) = &self.cache {
            cache.insert(LogItem::new(vlsn, entry_type, version, payload, before_image));
        }
        self.index.record(vlsn, lsn, entry_type, file_start);
        vlsn
    }

    /// Start a new log file
    pub fn roll(&self) -> u32 {
        let mut inner = self.inner.write();
        let has_entries = inner
            .files
            .get(&inner.current)
            .is_some_and(|entries| !entries.is_empty());
        if has_entries {
            inner.current += 1;
            let current = inner.current;
            inner.files.insert(current, Vec::new());
        }
        inner.current
    }

    /// Delete a file as the cleaner would. The range start only moves when
    /// the oldest file goes.
    pub fn clean_file(&self, file: u32) -> bool {
        let mut inner = self.inner.write();
        if file == inner.current || inner.files.remove(&file).is_none() {
            return false;
        }
        let new_first = inner
            .first_in(0)
            .and_then(|lsn| inner.entry(lsn))
            .map(|e| e.vlsn)
            .unwrap_or(Vlsn::NULL);
        debug!("Cleaned log file {}, oldest remaining vlsn {}", file, new_first);
        self.index.remove_file(file, new_first);
        true
    }

    /// Mark an entry as rolled back
    pub fn mark_invisible(&self, vlsn: Vlsn) -> bool {
        let mut inner = self.inner.write();
        let found = inner
            .files
            .values_mut()
            .flat_map(|entries| entries.iter_mut())
            .find(|e| e.vlsn == vlsn);
        match found {
            Some(entry) => {
                entry.invisible = true;
                let range = inner.compute_range();
                self.index.reset_range(range);
                true
            }
            None => false,
        }
    }

    /// Move everything appended so far out of the write buffers
    pub fn flush(&self) {
        let mut inner = self.inner.write();
        inner.flushed_through = inner.last_vlsn;
    }

    /// Numbers of the files currently present
    pub fn file_numbers(&self) -> Vec<u32> {
        self.inner.read().files.keys().copied().collect()
    }

    /// Visible entry with this sequence number
    pub fn get(&self, vlsn: Vlsn) -> Option<LogRecord> {
        let inner = self.inner.read();
        inner
            .find(vlsn)
            .filter(|(_, e)| !e.invisible)
            .map(|(lsn, e)| e.to_record(lsn))
    }
}

impl LogStore for MemoryLog {
    fn read(&self, lsn: Lsn) -> Result<LogRecord> {
        let inner = self.inner.read();
        inner
            .entry(lsn)
            .map(|e| e.to_record(lsn))
            .ok_or_else(|| Error::invalid_state(format!("No log entry at {}", lsn)))
    }

    fn next(&self, lsn: Lsn) -> Step {
        let inner = self.inner.read();
        let file = lsn.file_number();
        if let Some(entries) = inner.files.get(&file) {
            if (lsn.file_offset() as usize) + 1 < entries.len() {
                return Step::At(Lsn::new(file, lsn.file_offset() + 1));
            }
        }
        let mut expected = file + 1;
        for (&k, entries) in inner.files.range(file + 1..) {
            if k > expected {
                return match inner.first_in(k) {
                    Some(resume) => Step::Gap {
                        from_file: expected,
                        to_file: k - 1,
                        resume,
                    },
                    None => Step::End,
                };
            }
            if !entries.is_empty() {
                return Step::At(Lsn::new(k, 0));
            }
            expected = k + 1;
        }
        Step::End
    }

    fn prev(&self, lsn: Lsn) -> Step {
        let inner = self.inner.read();
        let file = lsn.file_number();
        if lsn.file_offset() > 0 && inner.files.contains_key(&file) {
            return Step::At(Lsn::new(file, lsn.file_offset() - 1));
        }
        let Some(mut expected) = file.checked_sub(1) else {
            return Step::End;
        };
        for (&k, entries) in inner.files.range(..file).rev() {
            if k < expected {
                return match inner.last_in(k) {
                    Some(resume) => Step::Gap {
                        from_file: k + 1,
                        to_file: expected,
                        resume,
                    },
                    None => Step::End,
                };
            }
            if !entries.is_empty() {
                return Step::At(Lsn::new(k, (entries.len() - 1) as u32));
            }
            match k.checked_sub(1) {
                Some(e) => expected = e,
                None => return Step::End,
            }
        }
        Step::End
    }

    fn first_lsn(&self) -> Lsn {
        self.inner.read().first_in(0).unwrap_or(Lsn::NULL)
    }

    fn last_lsn(&self) -> Lsn {
        self.inner.read().last_in(u32::MAX).unwrap_or(Lsn::NULL)
    }

    fn buffered(&self, vlsn: Vlsn) -> Option<LogRecord> {
        let inner = self.inner.read();
        if vlsn <= inner.flushed_through {
            return None;
        }
        inner.find(vlsn).map(|(lsn, e)| e.to_record(lsn))
    }
}

impl LocalLog for MemoryLog {
    fn range(&self) -> VlsnRange {
        self.index.range()
    }

    fn sync_point_at_or_before(&self, vlsn: Vlsn) -> Option<LogRecord> {
        let inner = self.inner.read();
        inner
            .entries()
            .rev()
            .find(|(_, e)| e.vlsn <= vlsn && !e.invisible && e.entry_type.is_sync_point())
            .map(|(lsn, e)| e.to_record(lsn))
    }

    fn record(&self, vlsn: Vlsn) -> Option<LogRecord> {
        self.get(vlsn)
    }

    fn truncate_after(&self, vlsn: Vlsn) -> Result<()> {
        let mut inner = self.inner.write();
        for entries in inner.files.values_mut() {
            entries.retain(|e| e.vlsn <= vlsn);
        }
        inner.last_vlsn = inner
            .last_in(u32::MAX)
            .and_then(|lsn| inner.entry(lsn))
            .map(|e| e.vlsn)
            .unwrap_or(Vlsn::NULL);
        if inner.flushed_through > inner.last_vlsn {
            inner.flushed_through = inner.last_vlsn;
        }
        let range = inner.compute_range();
        self.index.truncate_after(vlsn, range);
        debug!("Truncated local log after {}, range now {}", vlsn, range);
        Ok(())
    }
}

struct IndexState {
    map: BTreeMap<Vlsn, Lsn>,
    range: VlsnRange,
}

/// Sparse in-memory [`VlsnIndex`]
pub struct MemoryIndex {
    state: Mutex<IndexState>,
    appended: Condvar,
    stride: i64,
}

impl MemoryIndex {
    /// Index that maps every `stride`-th sequence number
    pub fn new(stride: u32) -> Self {
        Self {
            state: Mutex::new(IndexState {
                map: BTreeMap::new(),
                range: VlsnRange::empty(),
            }),
            appended: Condvar::new(),
            stride: i64::from(stride.max(1)),
        }
    }

    fn record(&self, vlsn: Vlsn, lsn: Lsn, entry_type: EntryType, file_start: bool) {
        let mut state = self.state.lock();
        if file_start || entry_type.is_sync_point() || vlsn.sequence() % self.stride == 0 {
            state.map.insert(vlsn, lsn);
        }
        if state.range.first.is_null() {
            state.range.first = vlsn;
        }
        state.range.last = vlsn;
        if entry_type.is_sync_point() {
            state.range.last_sync = vlsn;
        }
        if entry_type.is_txn_end() {
            state.range.last_txn_end = vlsn;
        }
        drop(state);
        self.appended.notify_all();
    }

    fn remove_file(&self, file: u32, new_first: Vlsn) {
        let mut state = self.state.lock();
        state.map.retain(|_, lsn| lsn.file_number() != file);
        if new_first.is_null() {
            state.range = VlsnRange::empty();
        } else if new_first > state.range.first {
            state.range.first = new_first;
        }
    }

    fn reset_range(&self, range: VlsnRange) {
        self.state.lock().range = range;
    }

    fn truncate_after(&self, vlsn: Vlsn, range: VlsnRange) {
        let mut state = self.state.lock();
        state.map.retain(|v, _| *v <= vlsn);
        state.range = range;
    }

    /// Number of mapped sequence numbers
    pub fn mapped(&self) -> usize {
        self.state.lock().map.len()
    }
}

impl VlsnIndex for MemoryIndex {
    fn range(&self) -> VlsnRange {
        self.state.lock().range
    }

    fn lsn_for(&self, vlsn: Vlsn) -> Option<Lsn> {
        self.state.lock().map.get(&vlsn).copied()
    }

    fn lsn_at_or_before(&self, vlsn: Vlsn) -> Option<(Vlsn, Lsn)> {
        self.state
            .lock()
            .map
            .range(..=vlsn)
            .next_back()
            .map(|(v, l)| (*v, *l))
    }

    fn lsn_at_or_after(&self, vlsn: Vlsn) -> Option<(Vlsn, Lsn)> {
        self.state
            .lock()
            .map
            .range(vlsn..)
            .next()
            .map(|(v, l)| (*v, *l))
    }

    fn await_vlsn(&self, vlsn: Vlsn, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        let mut state = self.state.lock();
        loop {
            if !state.range.is_empty() && state.range.last >= vlsn {
                return true;
            }
            if self.appended.wait_until(&mut state, deadline).timed_out() {
                return !state.range.is_empty() && state.range.last >= vlsn;
            }
        }
    }
}
