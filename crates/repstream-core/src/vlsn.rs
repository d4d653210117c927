//! Sequence numbers and physical log positions
//!
//! A [`Vlsn`] names a position in the logical replicated stream; an [`Lsn`]
//! names a physical position in the local log files. The two are related
//! only through the external VLSN index.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Virtual log sequence number.
///
/// Numbers assigned within one leader term strictly increase. The sentinels
/// sort below every real sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Vlsn(i64);

impl Vlsn {
    /// Unset / none
    pub const NULL: Vlsn = Vlsn(-1);
    /// Explicit failure marker
    pub const INVALID: Vlsn = Vlsn(0);
    /// Origin of every replicated stream
    pub const FIRST: Vlsn = Vlsn(1);

    /// Wrap a raw sequence value
    pub const fn new(sequence: i64) -> Self {
        Self(sequence)
    }

    /// Raw sequence value
    pub const fn sequence(self) -> i64 {
        self.0
    }

    /// Check for the NULL sentinel
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }

    /// True for real sequence numbers (not NULL, not INVALID)
    pub const fn is_valid(self) -> bool {
        self.0 >= Self::FIRST.0
    }

    /// Following sequence number
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Preceding sequence number, saturating at NULL
    pub const fn prev(self) -> Self {
        if self.0 <= Self::FIRST.0 {
            Self::NULL
        } else {
            Self(self.0 - 1)
        }
    }
}

impl fmt::Display for Vlsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NULL => write!(f, "NULL"),
            Self::INVALID => write!(f, "INVALID"),
            Self(v) => write!(f, "{}", v),
        }
    }
}

/// Physical log position: file number in the high 32 bits, byte offset in
/// the low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    /// No position
    pub const NULL: Lsn = Lsn(u64::MAX);

    /// Build from file number and offset
    pub const fn new(file_number: u32, file_offset: u32) -> Self {
        Self(((file_number as u64) << 32) | file_offset as u64)
    }

    /// File holding the entry
    pub const fn file_number(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Offset within the file
    pub const fn file_offset(self) -> u32 {
        self.0 as u32
    }

    /// Check for the NULL sentinel
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NULL_LSN")
        } else {
            write!(f, "0x{:x}/0x{:x}", self.file_number(), self.file_offset())
        }
    }
}

/// Window of sequence numbers currently available in the log.
///
/// Owned by the index; this crate only reads it, and re-reads it whenever a
/// decision depends on it because cleaning and appends move it concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlsnRange {
    /// Oldest available sequence number
    pub first: Vlsn,
    /// Newest available sequence number
    pub last: Vlsn,
    /// Newest sync point (commit, abort or matchpoint)
    pub last_sync: Vlsn,
    /// Newest transaction end (commit or abort)
    pub last_txn_end: Vlsn,
}

impl VlsnRange {
    /// Range of an empty log
    pub const fn empty() -> Self {
        Self {
            first: Vlsn::NULL,
            last: Vlsn::NULL,
            last_sync: Vlsn::NULL,
            last_txn_end: Vlsn::NULL,
        }
    }

    /// True when the log holds no replicated entries
    pub fn is_empty(&self) -> bool {
        self.first.is_null() || self.last.is_null()
    }

    /// Whether `vlsn` lies within `[first, last]`
    pub fn contains(&self, vlsn: Vlsn) -> bool {
        !self.is_empty() && vlsn >= self.first && vlsn <= self.last
    }

    /// Number of sequence numbers in the range
    pub fn size(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            (self.last.sequence() - self.first.sequence() + 1) as u64
        }
    }
}

impl Default for VlsnRange {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for VlsnRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}] sync={} txnEnd={}",
            self.first, self.last, self.last_sync, self.last_txn_end
        )
    }
}
