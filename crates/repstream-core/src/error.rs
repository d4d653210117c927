//! Error types for the replication stream engine

use crate::protocol::PeerInfo;
use crate::vlsn::Vlsn;
use crate::TxnId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the stream Error
pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories surfaced by the feeder, the consumer and their helpers.
///
/// Gaps found while scanning the log backward are not errors: they are
/// reported through [`crate::log::ScanOutcome::Gap`] and handled by the
/// immediate caller.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or version-incompatible wire data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No mutually supported protocol version
    #[error("Incompatible protocol version: local {local}, remote {remote}: {reason}")]
    IncompatibleVersion {
        /// Version bound advertised by this node
        local: u16,
        /// Version bound advertised by the peer
        remote: u16,
        /// Human readable explanation
        reason: String,
    },

    /// Channel closed or keepalive failed during a long scan
    #[error("Sync failed: {0}")]
    SyncFailed(String),

    /// Precondition violation; indicates a bug
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Ack quorum not met within the deadline
    #[error(
        "Insufficient acks for txn {txn_id}: required {required}, received {received} within {timeout:?}"
    )]
    InsufficientAcks {
        /// Transaction awaiting acknowledgment
        txn_id: TxnId,
        /// Acks the durability policy required
        required: u32,
        /// Acks received before the deadline
        received: u32,
        /// Timeout that expired
        timeout: Duration,
    },

    /// Leader-consistency check failed
    #[error("Leader obsolete: node leader {node_leader}, group leader {group_leader}")]
    LeaderObsolete {
        /// Leader this node is acting upon
        node_leader: String,
        /// Leader reported by the group
        group_leader: String,
    },

    /// No usable matchpoint; incremental sync is impossible
    #[error("Network restore required at vlsn {vlsn}: {reason}")]
    NetworkRestoreRequired {
        /// Sequence number at which incremental sync failed
        vlsn: Vlsn,
        /// Why the feeder could not supply a matchpoint
        reason: String,
        /// Peers able to serve a full copy
        peers: Vec<PeerInfo>,
    },

    /// Session shut down while work was pending
    #[error("Session terminated: {0}")]
    SessionTerminated(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a sync failed error
    pub fn sync_failed(msg: impl Into<String>) -> Self {
        Self::SyncFailed(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a session terminated error
    pub fn session_terminated(msg: impl Into<String>) -> Self {
        Self::SessionTerminated(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a network restore error without candidate peers
    pub fn network_restore(vlsn: Vlsn, reason: impl Into<String>) -> Self {
        Self::NetworkRestoreRequired {
            vlsn,
            reason: reason.into(),
            peers: Vec::new(),
        }
    }

    /// Whether the error ends the current session.
    ///
    /// Only `InsufficientAcks` is scoped to a single transaction.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InsufficientAcks { .. })
    }

    /// Whether the session owner must fall back to a full network restore
    pub fn requires_network_restore(&self) -> bool {
        matches!(self, Self::NetworkRestoreRequired { .. })
    }
}
