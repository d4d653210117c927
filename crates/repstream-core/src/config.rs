//! Replication stream configuration

use crate::protocol::version::{MAX_VERSION, MIN_VERSION};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables shared by feeder and consumer sessions.
///
/// Durations serialize as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Lowest protocol version this node will speak
    pub min_protocol_version: u16,

    /// Highest protocol version this node will speak
    pub max_protocol_version: u16,

    /// Capacity of the arbiter fast-ack queue
    pub overflow_queue_capacity: usize,

    /// Period of the async ack expiry sweep
    #[serde(with = "serde_millis")]
    pub ack_sweep_period: Duration,

    /// Tolerated difference between feeder and consumer clocks
    #[serde(with = "serde_millis")]
    pub max_clock_skew: Duration,

    /// Range size (entries) above which a request from `Vlsn::FIRST` is
    /// answered with "not found" instead of replaying the whole log
    pub max_initial_replay: u64,

    /// Fraction of `feeder_timeout` after which a single scan logs a warning
    pub scan_warn_fraction: f64,

    /// Peer idle timeout; a silent connection is dropped after this
    #[serde(with = "serde_millis")]
    pub feeder_timeout: Duration,

    /// Keepalives are sent every `feeder_timeout / keepalive_fraction`
    pub keepalive_fraction: u32,

    /// Entries visited between channel-open checks during scans
    pub channel_check_entries: u32,

    /// Outstanding keepalives tolerated before the scan fails
    pub max_unanswered_keepalives: u32,

    /// Idle interval between feeder heartbeats
    #[serde(with = "serde_millis")]
    pub heartbeat_interval: Duration,

    /// Longest wait for a single record before the feeder checks for work
    #[serde(with = "serde_millis")]
    pub record_wait: Duration,

    /// Entries kept in the shared item cache
    pub item_cache_capacity: usize,

    /// Only feed entries the group has made durable
    pub durable_only: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_protocol_version: MIN_VERSION,
            max_protocol_version: MAX_VERSION,
            overflow_queue_capacity: 1024,
            ack_sweep_period: Duration::from_millis(100),
            max_clock_skew: Duration::from_secs(2),
            // Roughly a minute of replay at 10k entries/sec.
            max_initial_replay: 600_000,
            scan_warn_fraction: 0.5,
            feeder_timeout: Duration::from_secs(30),
            keepalive_fraction: 5,
            channel_check_entries: 100,
            max_unanswered_keepalives: 3,
            heartbeat_interval: Duration::from_secs(1),
            record_wait: Duration::from_millis(100),
            item_cache_capacity: 4096,
            durable_only: false,
        }
    }
}

impl StreamConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Restrict the protocol versions this node offers
    pub fn with_protocol_versions(mut self, min: u16, max: u16) -> Self {
        self.min_protocol_version = min;
        self.max_protocol_version = max;
        self
    }

    /// Set the peer idle timeout
    pub fn with_feeder_timeout(mut self, timeout: Duration) -> Self {
        self.feeder_timeout = timeout;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the large-initial-replay threshold
    pub fn with_max_initial_replay(mut self, entries: u64) -> Self {
        self.max_initial_replay = entries;
        self
    }

    /// Only feed durable entries
    pub fn with_durable_only(mut self, durable_only: bool) -> Self {
        self.durable_only = durable_only;
        self
    }

    /// Interval between keepalives during long scans
    pub fn keepalive_interval(&self) -> Duration {
        self.feeder_timeout / self.keepalive_fraction.max(1)
    }

    /// Duration after which a single scan is reported as slow
    pub fn scan_warn_threshold(&self) -> Duration {
        self.feeder_timeout.mul_f64(self.scan_warn_fraction)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.min_protocol_version > self.max_protocol_version {
            return Err(Error::config(format!(
                "min_protocol_version {} exceeds max_protocol_version {}",
                self.min_protocol_version, self.max_protocol_version
            )));
        }
        if self.min_protocol_version < MIN_VERSION || self.max_protocol_version > MAX_VERSION {
            return Err(Error::config(format!(
                "protocol versions must lie within [{}, {}]",
                MIN_VERSION, MAX_VERSION
            )));
        }
        if self.overflow_queue_capacity == 0 {
            return Err(Error::config("overflow_queue_capacity must be at least 1"));
        }
        if self.keepalive_fraction == 0 {
            return Err(Error::config("keepalive_fraction must be at least 1"));
        }
        if self.channel_check_entries == 0 {
            return Err(Error::config("channel_check_entries must be at least 1"));
        }
        if !(self.scan_warn_fraction > 0.0 && self.scan_warn_fraction <= 1.0) {
            return Err(Error::config("scan_warn_fraction must lie in (0, 1]"));
        }
        if self.ack_sweep_period.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(Error::config(
                "ack_sweep_period and heartbeat_interval must be non-zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.keepalive_interval(), Duration::from_secs(6));
        assert_eq!(config.scan_warn_threshold(), Duration::from_secs(15));
    }

    #[test]
    fn test_inverted_versions_rejected() {
        let config = StreamConfig::default().with_protocol_versions(12, 9);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let config = StreamConfig {
            overflow_queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"feeder_timeout": 10000, "max_initial_replay": 50, "durable_only": true}}"#
        )
        .unwrap();

        let config = StreamConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.feeder_timeout, Duration::from_secs(10));
        assert_eq!(config.max_initial_replay, 50);
        assert!(config.durable_only);
        assert_eq!(config.keepalive_fraction, 5);
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = StreamConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
