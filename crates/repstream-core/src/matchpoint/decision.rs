//! Feeder-side answer to a matchpoint probe

use crate::protocol::{EntryRequestMode, NodeType};
use crate::vlsn::{Vlsn, VlsnRange};
use crate::{Error, Result};

/// A consumer's `EntryRequest` in context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryProbe {
    /// Requested sequence number
    pub vlsn: Vlsn,
    /// Out-of-range handling
    pub mode: EntryRequestMode,
    /// No response has been sent yet this session
    pub first_response: bool,
    /// Kind of consumer asking
    pub requester: NodeType,
}

/// What the feeder answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Send the entry at this sequence number
    Entry(Vlsn),
    /// Propose this sequence number instead
    AltMatchpoint(Vlsn),
    /// No usable entry; the consumer must restore
    NotFound,
}

/// Decide how to answer `probe` given the feeder's current `range`.
///
/// `max_initial_replay` bounds how many entries a non-subscriber may replay
/// from the very start of the stream before a restore is cheaper.
pub fn decide(probe: &EntryProbe, range: &VlsnRange, max_initial_replay: u64) -> Result<Decision> {
    if range.is_empty() {
        return Ok(Decision::NotFound);
    }

    if probe.mode == EntryRequestMode::Now {
        return Ok(Decision::Entry(range.last));
    }

    if probe.vlsn < range.first {
        return Ok(match probe.mode {
            EntryRequestMode::Available => Decision::Entry(range.first),
            _ => Decision::NotFound,
        });
    }

    if probe.vlsn > range.last {
        if probe.mode == EntryRequestMode::Available {
            return Ok(Decision::Entry(range.last));
        }
        if !probe.first_response {
            return Err(Error::protocol(format!(
                "Entry request for {} beyond range {} after the first response",
                probe.vlsn, range
            )));
        }
        return Ok(if range.last_sync.is_valid() {
            Decision::AltMatchpoint(range.last_sync)
        } else {
            Decision::NotFound
        });
    }

    if probe.vlsn == Vlsn::FIRST
        && probe.requester != NodeType::Subscriber
        && range.size() > max_initial_replay
    {
        return Ok(Decision::NotFound);
    }

    Ok(Decision::Entry(probe.vlsn))
}
