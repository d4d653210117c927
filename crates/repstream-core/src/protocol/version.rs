//! Protocol versions, field introduction points and negotiation

use crate::{Error, Result};

/// Oldest protocol version still spoken
pub const MIN_VERSION: u16 = 5;

/// Newest protocol version
pub const MAX_VERSION: u16 = 15;

/// `EntryRequest` carries a request mode
pub const ENTRY_REQUEST_MODE_VERSION: u16 = 7;

/// Older peers mis-parse format 12 entries; relabel them when feeding those
pub const FIX_LOG_VERSION_12_VERSION: u16 = 8;

/// Heartbeats carry an id echoed by the response
pub const HEARTBEAT_ID_VERSION: u16 = 11;

/// Heartbeat responses carry subscription filter statistics
pub const FILTER_STATS_VERSION: u16 = 12;

/// Heartbeat responses carry the sender's clock
pub const SENDER_TIME_VERSION: u16 = 13;

/// Acks and heartbeat responses carry the consumer's durable VLSN
pub const DURABLE_VLSN_VERSION: u16 = 14;

/// Entries may carry a before-image
pub const BEFORE_IMAGE_VERSION: u16 = 15;

/// Entry format version written by this release
pub const CURRENT_LOG_VERSION: u8 = 16;

const MIN_RELEASES: [(u16, &str); 11] = [
    (5, "4.0.0"),
    (6, "4.3.0"),
    (7, "4.4.0"),
    (8, "18.1.0"),
    (9, "18.3.0"),
    (10, "19.1.0"),
    (11, "19.3.0"),
    (12, "20.1.0"),
    (13, "20.3.0"),
    (14, "21.2.0"),
    (15, "22.1.0"),
];

/// Oldest software release that speaks `version`
pub fn min_release(version: u16) -> Option<&'static str> {
    MIN_RELEASES
        .iter()
        .find(|(v, _)| *v == version)
        .map(|(_, release)| *release)
}

/// Inclusive range of protocol versions a node supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    /// Lowest supported version
    pub min: u16,
    /// Highest supported version
    pub max: u16,
}

impl VersionRange {
    /// Build a range
    pub const fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    /// Everything this build understands
    pub const fn supported() -> Self {
        Self::new(MIN_VERSION, MAX_VERSION)
    }

    /// Whether `version` lies in the range
    pub fn contains(&self, version: u16) -> bool {
        version >= self.min && version <= self.max
    }
}

fn describe(version: u16) -> String {
    match min_release(version) {
        Some(release) => format!("{} (release {})", version, release),
        None => version.to_string(),
    }
}

/// Pick the session version: the smaller of the two maxima.
///
/// Fails when either side's minimum exceeds the other side's maximum.
pub fn negotiate(initiator: VersionRange, responder: VersionRange) -> Result<u16> {
    if responder.min > initiator.max {
        return Err(Error::IncompatibleVersion {
            local: responder.min,
            remote: initiator.max,
            reason: format!(
                "responder requires at least version {}, initiator supports at most {}",
                describe(responder.min),
                describe(initiator.max)
            ),
        });
    }
    if initiator.min > responder.max {
        return Err(Error::IncompatibleVersion {
            local: responder.max,
            remote: initiator.min,
            reason: format!(
                "initiator requires at least version {}, responder supports at most {}",
                describe(initiator.min),
                describe(responder.max)
            ),
        });
    }
    Ok(initiator.max.min(responder.max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_picks_lower_max() {
        let v = negotiate(VersionRange::new(5, 12), VersionRange::new(5, 15)).unwrap();
        assert_eq!(v, 12);
        let v = negotiate(VersionRange::new(5, 15), VersionRange::new(9, 13)).unwrap();
        assert_eq!(v, 13);
    }

    #[test]
    fn test_negotiate_rejects_disjoint_ranges() {
        let err = negotiate(VersionRange::new(5, 8), VersionRange::new(11, 15)).unwrap_err();
        match err {
            Error::IncompatibleVersion {
                local,
                remote,
                reason,
            } => {
                assert_eq!(local, 11);
                assert_eq!(remote, 8);
                assert!(reason.contains("19.3.0"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_release_table_covers_supported_versions() {
        for v in MIN_VERSION..=MAX_VERSION {
            assert!(min_release(v).is_some(), "no release for version {v}");
        }
        assert_eq!(min_release(MAX_VERSION + 1), None);
    }
}
