//! Read window over the local log

use super::record::LogRecord;
use crate::Result;
use crate::vlsn::{Lsn, Vlsn};

/// Result of stepping from one physical position to the next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Next entry lives here
    At(Lsn),
    /// Files `from_file..=to_file` were cleaned; the walk may resume at `resume`
    Gap {
        /// First missing file
        from_file: u32,
        /// Last missing file
        to_file: u32,
        /// First position past the gap in the walking direction
        resume: Lsn,
    },
    /// No more entries in this direction
    End,
}

/// Read-only access to log entries owned by the storage engine.
///
/// Implementations must be safe to share across sessions; appends and
/// cleaning happen concurrently with reads.
pub trait LogStore: Send + Sync {
    /// Entry at `lsn`
    fn read(&self, lsn: Lsn) -> Result<LogRecord>;

    /// Position after `lsn`
    fn next(&self, lsn: Lsn) -> Step;

    /// Position before `lsn`
    fn prev(&self, lsn: Lsn) -> Step;

    /// Oldest entry position, NULL when empty
    fn first_lsn(&self) -> Lsn;

    /// Newest entry position, NULL when empty
    fn last_lsn(&self) -> Lsn;

    /// Entry still sitting in the write buffers, not yet on disk
    fn buffered(&self, vlsn: Vlsn) -> Option<LogRecord>;
}
