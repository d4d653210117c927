//! Protocol version handshake
//!
//! The consumer opens with its supported range; the feeder picks the session
//! version or refuses. Both sides then switch the channel to the negotiated
//! stream context.

use super::context::ProtocolContext;
use super::message::{Message, NodeType};
use super::version::{self, CURRENT_LOG_VERSION, VersionRange};
use crate::channel::Channel;
use crate::config::StreamConfig;
use crate::{Error, NodeId, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Identity and capabilities this node advertises
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNode {
    /// Node id
    pub node_id: NodeId,
    /// Group member name
    pub node_name: String,
    /// Kind of node
    pub node_type: NodeType,
    /// Protocol versions offered
    pub versions: VersionRange,
    /// Newest entry format written or read
    pub log_version: u8,
}

impl LocalNode {
    /// Node speaking every supported version
    pub fn new(node_id: NodeId, node_name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            node_id,
            node_name: node_name.into(),
            node_type,
            versions: VersionRange::supported(),
            log_version: CURRENT_LOG_VERSION,
        }
    }

    /// Restrict the offered versions to those in `config`
    pub fn with_config(mut self, config: &StreamConfig) -> Self {
        self.versions = VersionRange::new(config.min_protocol_version, config.max_protocol_version);
        self
    }

    /// Override the offered versions
    pub fn with_versions(mut self, versions: VersionRange) -> Self {
        self.versions = versions;
        self
    }

    /// Override the entry format version
    pub fn with_log_version(mut self, log_version: u8) -> Self {
        self.log_version = log_version;
        self
    }
}

/// Outcome of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Peer node id
    pub peer_id: NodeId,
    /// Peer name
    pub peer_name: String,
    /// Peer kind; the feeder side always sees a consumer kind
    pub peer_type: NodeType,
    /// Session context, already installed on the channel
    pub context: ProtocolContext,
}

fn await_message(channel: &dyn Channel, wait: Duration) -> Result<Message> {
    channel.receive(wait)?.ok_or_else(|| {
        Error::sync_failed(format!(
            "No handshake message from {} within {:?}",
            channel.peer_name(),
            wait
        ))
    })
}

/// Feeder side: answer a version request
pub fn feeder_handshake(
    channel: &dyn Channel,
    local: &LocalNode,
    wait: Duration,
) -> Result<HandshakeResult> {
    channel.set_context(ProtocolContext::handshake());
    let (range, node_id, node_name, node_type, log_version) = match await_message(channel, wait)? {
        Message::ProtocolVersionRequest {
            min_version,
            max_version,
            node_id,
            node_name,
            node_type,
            log_version,
        } => (
            VersionRange::new(min_version, max_version),
            node_id,
            node_name,
            node_type,
            log_version,
        ),
        other => {
            return Err(Error::protocol(format!(
                "Expected ProtocolVersionRequest, got {:?}",
                other.opcode()
            )));
        }
    };

    let version = match version::negotiate(range, local.versions) {
        Ok(v) => v,
        Err(err) => {
            warn!(
                "Refusing {} ({:?}) offering versions {}..={}: {}",
                node_name, node_type, range.min, range.max, err
            );
            let _ = channel.send(&Message::IncompatibleVersion {
                reason: err.to_string(),
            });
            return Err(err);
        }
    };

    channel.send(&Message::ProtocolVersionResponse {
        version,
        node_id: local.node_id,
        log_version: local.log_version,
    })?;

    let context = ProtocolContext::negotiated(version, log_version.min(local.log_version));
    channel.set_context(context);
    info!(
        "Handshake with {} ({:?}, node {}) negotiated protocol version {}",
        node_name, node_type, node_id, version
    );

    Ok(HandshakeResult {
        peer_id: node_id,
        peer_name: node_name,
        peer_type: node_type,
        context,
    })
}

/// Consumer side: offer our versions and adopt the feeder's choice
pub fn consumer_handshake(
    channel: &dyn Channel,
    local: &LocalNode,
    wait: Duration,
) -> Result<HandshakeResult> {
    channel.set_context(ProtocolContext::handshake());
    channel.send(&Message::ProtocolVersionRequest {
        min_version: local.versions.min,
        max_version: local.versions.max,
        node_id: local.node_id,
        node_name: local.node_name.clone(),
        node_type: local.node_type,
        log_version: local.log_version,
    })?;

    match await_message(channel, wait)? {
        Message::ProtocolVersionResponse {
            version,
            node_id,
            log_version,
        } => {
            if !local.versions.contains(version) {
                return Err(Error::IncompatibleVersion {
                    local: local.versions.max,
                    remote: version,
                    reason: format!(
                        "feeder chose version {} outside {}..={}",
                        version, local.versions.min, local.versions.max
                    ),
                });
            }
            let context = ProtocolContext::negotiated(version, log_version.min(local.log_version));
            channel.set_context(context);
            info!(
                "Feeder {} (node {}) accepted protocol version {}",
                channel.peer_name(),
                node_id,
                version
            );
            Ok(HandshakeResult {
                peer_id: node_id,
                peer_name: channel.peer_name(),
                peer_type: NodeType::Replica,
                context,
            })
        }
        Message::IncompatibleVersion { reason } => Err(Error::IncompatibleVersion {
            local: local.versions.max,
            remote: 0,
            reason,
        }),
        other => Err(Error::protocol(format!(
            "Expected ProtocolVersionResponse, got {:?}",
            other.opcode()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use std::thread;

    #[test]
    fn test_handshake_negotiates_lower_max() {
        let (feeder_side, consumer_side) = MemoryChannel::pair("feeder", "replica");
        let feeder = LocalNode::new(1, "feeder", NodeType::Replica);
        let consumer = LocalNode::new(2, "replica", NodeType::Replica)
            .with_versions(VersionRange::new(5, 12));

        let t = thread::spawn(move || {
            let result = consumer_handshake(&consumer_side, &consumer, Duration::from_secs(5)).unwrap();
            (result, consumer_side.context())
        });
        let result = feeder_handshake(&feeder_side, &feeder, Duration::from_secs(5)).unwrap();
        let (consumer_result, consumer_ctx) = t.join().unwrap();

        assert_eq!(result.context.version, 12);
        assert_eq!(result.peer_name, "replica");
        assert_eq!(result.peer_id, 2);
        assert_eq!(consumer_result.context.version, 12);
        assert_eq!(consumer_ctx, feeder_side.context());
        assert_eq!(consumer_result.peer_id, 1);
    }

    #[test]
    fn test_handshake_refuses_disjoint_versions() {
        let (feeder_side, consumer_side) = MemoryChannel::pair("feeder", "replica");
        let feeder = LocalNode::new(1, "feeder", NodeType::Replica)
            .with_versions(VersionRange::new(12, 15));
        let consumer = LocalNode::new(2, "replica", NodeType::Arbiter)
            .with_versions(VersionRange::new(5, 9));

        let t = thread::spawn(move || consumer_handshake(&consumer_side, &consumer, Duration::from_secs(5)));
        let err = feeder_handshake(&feeder_side, &feeder, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::IncompatibleVersion { local: 12, remote: 9, .. }));

        let consumer_err = t.join().unwrap().unwrap_err();
        assert!(matches!(consumer_err, Error::IncompatibleVersion { .. }));
    }

    #[test]
    fn test_handshake_times_out() {
        let (feeder_side, _consumer_side) = MemoryChannel::pair("feeder", "replica");
        let feeder = LocalNode::new(1, "feeder", NodeType::Replica);
        let err = feeder_handshake(&feeder_side, &feeder, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::SyncFailed(_)));
    }
}
