//! Sequence number to log position index

use crate::vlsn::{Lsn, Vlsn, VlsnRange};
use std::time::Duration;

/// Mapping from sequence numbers to physical positions.
///
/// The index may be sparse: only some sequence numbers have an exact
/// mapping, and scans start from the nearest mapped neighbour.
pub trait VlsnIndex: Send + Sync {
    /// Current available range
    fn range(&self) -> VlsnRange;

    /// Exact mapping, if indexed
    fn lsn_for(&self, vlsn: Vlsn) -> Option<Lsn>;

    /// Nearest mapping at or below `vlsn`
    fn lsn_at_or_before(&self, vlsn: Vlsn) -> Option<(Vlsn, Lsn)>;

    /// Nearest mapping at or above `vlsn`
    fn lsn_at_or_after(&self, vlsn: Vlsn) -> Option<(Vlsn, Lsn)>;

    /// Block until `vlsn` is in range or `wait` elapses; true if available
    fn await_vlsn(&self, vlsn: Vlsn, wait: Duration) -> bool;
}
