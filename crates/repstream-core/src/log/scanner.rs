//! Cursor over the replicated log
//!
//! A [`LogScanner`] resolves a sequence number to a physical start through
//! the index and walks the log in one direction. Forward scans feed the
//! stream; backward scans locate matchpoints. Cleaning may delete files
//! under a backward scan, which is reported as [`ScanOutcome::Gap`] for the
//! immediate caller to handle.

use super::index::VlsnIndex;
use super::record::LogRecord;
use super::store::{LogStore, Step};
use crate::vlsn::{Lsn, Vlsn};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Scanner life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    /// Not initialized
    Idle,
    /// Start position resolved
    Positioned,
    /// A scan call is in progress
    Scanning,
    /// Last scan returned its target
    TargetFound,
    /// Last backward scan hit cleaned files
    GapDetected,
    /// Last scan ran out of entries
    EndOfLog,
}

/// Result of a backward scan
#[derive(Debug)]
pub enum ScanOutcome {
    /// The target entry
    Found(LogRecord),
    /// Files `from_file..=to_file` were cleaned between the start and the target
    Gap {
        /// First missing file
        from_file: u32,
        /// Last missing file
        to_file: u32,
        /// Target being searched for
        vlsn: Vlsn,
    },
    /// No visible entry with the target sequence number
    EndOfLog,
}

/// Hook invoked once per visited entry during scans
pub trait ScanMonitor: Send {
    /// Fail the scan by returning an error
    fn on_entry(&mut self, entries_scanned: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Single-direction cursor; one per session
pub struct LogScanner {
    store: Arc<dyn LogStore>,
    index: Arc<dyn VlsnIndex>,
    state: ScannerState,
    direction: Direction,
    /// Next position to read, or the position last returned when `consumed`
    position: Lsn,
    consumed: bool,
    /// Position of the last entry handed out by this scanner
    confirmed_lsn: Lsn,
    last_returned: Vlsn,
    reposition: bool,
    entries_scanned: u64,
    monitor: Option<Box<dyn ScanMonitor>>,
    warn_after: Option<Duration>,
}

impl LogScanner {
    /// New idle scanner
    pub fn new(store: Arc<dyn LogStore>, index: Arc<dyn VlsnIndex>) -> Self {
        Self {
            store,
            index,
            state: ScannerState::Idle,
            direction: Direction::Forward,
            position: Lsn::NULL,
            consumed: false,
            confirmed_lsn: Lsn::NULL,
            last_returned: Vlsn::NULL,
            reposition: false,
            entries_scanned: 0,
            monitor: None,
            warn_after: None,
        }
    }

    /// Install a per-entry monitor
    pub fn with_monitor(mut self, monitor: Box<dyn ScanMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Warn when a single scan call runs longer than `threshold`
    pub fn with_slow_scan_warning(mut self, threshold: Duration) -> Self {
        self.warn_after = Some(threshold);
        self
    }

    /// Current state
    pub fn state(&self) -> ScannerState {
        self.state
    }

    /// Entries visited since creation
    pub fn entries_scanned(&self) -> u64 {
        self.entries_scanned
    }

    /// Sequence number of the last entry handed out
    pub fn last_returned(&self) -> Vlsn {
        self.last_returned
    }

    fn reset(&mut self, direction: Direction, position: Lsn) {
        self.direction = direction;
        self.position = position;
        self.consumed = false;
        self.confirmed_lsn = Lsn::NULL;
        self.last_returned = Vlsn::NULL;
        self.reposition = false;
        self.state = ScannerState::Positioned;
    }

    /// Position for forward scanning starting at `start`
    pub fn init_forward(&mut self, start: Vlsn) -> Result<()> {
        if start.is_null() {
            return Err(Error::invalid_state("Forward scan start is NULL"));
        }
        let position = self
            .index
            .lsn_at_or_before(start)
            .map(|(_, lsn)| lsn)
            .unwrap_or_else(|| self.store.first_lsn());
        debug!("Forward scanner positioned at {} for {}", position, start);
        self.reset(Direction::Forward, position);
        Ok(())
    }

    /// Position for backward scanning starting at `start`
    pub fn init_backward(&mut self, start: Vlsn) -> Result<()> {
        if start.is_null() {
            return Err(Error::invalid_state("Backward scan start is NULL"));
        }
        let position = self
            .index
            .lsn_for(start)
            .or_else(|| self.index.lsn_at_or_after(start).map(|(_, lsn)| lsn))
            .unwrap_or_else(|| self.store.last_lsn());
        debug!("Backward scanner positioned at {} for {}", position, start);
        self.reset(Direction::Backward, position);
        Ok(())
    }

    /// Note that `vlsn` was served from a cache instead of this scanner.
    ///
    /// The physical position is now stale; the next forward scan
    /// repositions through the index.
    pub fn note_cache_hit(&mut self, vlsn: Vlsn) {
        if vlsn > self.last_returned {
            self.last_returned = vlsn;
        }
        self.reposition = true;
    }

    fn visit(&mut self) -> Result<()> {
        self.entries_scanned += 1;
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.on_entry(self.entries_scanned)?;
        }
        Ok(())
    }

    fn check_slow(&self, target: Vlsn, started: Instant, visited_before: u64) {
        if let Some(threshold) = self.warn_after {
            let elapsed = started.elapsed();
            if elapsed > threshold {
                warn!(
                    "Slow log scan for {}: {:?}, {} entries visited",
                    target,
                    elapsed,
                    self.entries_scanned - visited_before
                );
            }
        }
    }

    /// Wait up to `wait` for `target` and return it; `Ok(None)` on timeout
    pub fn scan_forward(&mut self, target: Vlsn, wait: Duration) -> Result<Option<LogRecord>> {
        if self.direction != Direction::Forward || self.state == ScannerState::Idle {
            return Err(Error::invalid_state("Scanner not positioned for forward scans"));
        }
        if target.is_null() {
            return Err(Error::invalid_state("Forward scan target is NULL"));
        }
        if self.last_returned.is_valid() && target < self.last_returned {
            return Err(Error::invalid_state(format!(
                "Forward scan moved backward: target {} below last returned {}",
                target, self.last_returned
            )));
        }
        if !self.index.await_vlsn(target, wait) {
            return Ok(None);
        }

        let started = Instant::now();
        let visited_before = self.entries_scanned;
        self.state = ScannerState::Scanning;
        let result = self.forward_to(target);
        self.check_slow(target, started, visited_before);
        match &result {
            Ok(Some(_)) => self.state = ScannerState::TargetFound,
            Ok(None) => self.state = ScannerState::EndOfLog,
            Err(_) => {}
        }
        result
    }

    fn forward_to(&mut self, target: Vlsn) -> Result<Option<LogRecord>> {
        if self.reposition || (self.last_returned.is_valid() && target <= self.last_returned) {
            self.reposition = false;
            if let Some((_, lsn)) = self.index.lsn_at_or_before(target) {
                // Never move behind what this scanner already handed out.
                if self.confirmed_lsn.is_null() || lsn > self.confirmed_lsn {
                    self.position = lsn;
                    self.consumed = false;
                } else if target <= self.last_returned && !self.confirmed_lsn.is_null() {
                    self.position = self.confirmed_lsn;
                    self.consumed = false;
                }
            }
        }
        if self.position.is_null() {
            self.position = self.store.first_lsn();
            self.consumed = false;
            if self.position.is_null() {
                return Ok(None);
            }
        }

        loop {
            if self.consumed {
                match self.store.next(self.position) {
                    Step::At(lsn) => {
                        self.position = lsn;
                        self.consumed = false;
                    }
                    Step::Gap {
                        from_file,
                        to_file,
                        resume,
                    } => {
                        debug!(
                            "Forward scan for {} skipping cleaned files {}..={}",
                            target, from_file, to_file
                        );
                        self.position = resume;
                        self.consumed = false;
                    }
                    Step::End => return Ok(None),
                }
            }

            let record = self.store.read(self.position)?;
            self.visit()?;
            self.consumed = true;

            if record.invisible {
                continue;
            }
            if record.vlsn == target {
                self.confirmed_lsn = self.position;
                self.last_returned = target;
                return Ok(Some(record));
            }
            if record.vlsn > target {
                // Leave the entry for the next call.
                self.consumed = false;
                return Err(Error::invalid_state(format!(
                    "Entry {} missing from the log, next entry is {}",
                    target, record.vlsn
                )));
            }
        }
    }

    /// Walk backward to `target`
    pub fn scan_backward(&mut self, target: Vlsn) -> Result<ScanOutcome> {
        if self.direction != Direction::Backward || self.state == ScannerState::Idle {
            return Err(Error::invalid_state("Scanner not positioned for backward scans"));
        }
        if target.is_null() {
            return Err(Error::invalid_state("Backward scan target is NULL"));
        }
        if self.last_returned.is_valid() && target > self.last_returned {
            return Err(Error::invalid_state(format!(
                "Backward scan moved forward: target {} above last returned {}",
                target, self.last_returned
            )));
        }

        let started = Instant::now();
        let visited_before = self.entries_scanned;
        self.state = ScannerState::Scanning;
        let result = self.backward_to(target);
        self.check_slow(target, started, visited_before);
        if let Ok(outcome) = &result {
            self.state = match outcome {
                ScanOutcome::Found(_) => ScannerState::TargetFound,
                ScanOutcome::Gap { .. } => ScannerState::GapDetected,
                ScanOutcome::EndOfLog => ScannerState::EndOfLog,
            };
        }
        result
    }

    fn backward_to(&mut self, target: Vlsn) -> Result<ScanOutcome> {
        if self.position.is_null() {
            return Ok(ScanOutcome::EndOfLog);
        }
        loop {
            if self.consumed {
                match self.store.prev(self.position) {
                    Step::At(lsn) => {
                        self.position = lsn;
                        self.consumed = false;
                    }
                    Step::Gap {
                        from_file,
                        to_file,
                        resume,
                    } => {
                        self.position = resume;
                        self.consumed = false;
                        return Ok(ScanOutcome::Gap {
                            from_file,
                            to_file,
                            vlsn: target,
                        });
                    }
                    Step::End => return Ok(ScanOutcome::EndOfLog),
                }
            }

            let record = match self.store.read(self.position) {
                Ok(record) => record,
                // The file under the cursor was cleaned after positioning.
                Err(_) => {
                    let file = self.position.file_number();
                    self.consumed = true;
                    return Ok(ScanOutcome::Gap {
                        from_file: file,
                        to_file: file,
                        vlsn: target,
                    });
                }
            };
            self.visit()?;
            self.consumed = true;

            if record.invisible {
                continue;
            }
            if record.vlsn == target {
                self.confirmed_lsn = self.position;
                self.last_returned = target;
                return Ok(ScanOutcome::Found(record));
            }
            if record.vlsn < target {
                self.consumed = false;
                return Ok(ScanOutcome::EndOfLog);
            }
        }
    }
}
