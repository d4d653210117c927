//! Replication stream wire protocol
//!
//! - [`message`]: the closed message set and version-gated body layouts
//! - [`codec`]: frame encoding and blocking/async stream helpers
//! - [`version`]: version constants and negotiation
//! - [`context`]: per-session codec parameters
//! - [`handshake`]: version handshake over a [`crate::channel::Channel`]
//! - [`stats`]: per-channel counters

pub mod codec;
pub mod context;
pub mod handshake;
pub mod message;
pub mod stats;
pub mod version;

pub use context::ProtocolContext;
pub use handshake::{HandshakeResult, LocalNode, consumer_handshake, feeder_handshake};
pub use message::{
    EntryRequestMode, FilterStats, Message, NodeType, Opcode, PeerInfo, SubProtocol, SyncPolicy,
    WireRecord,
};
pub use stats::{ProtocolStats, ProtocolStatsSnapshot};
pub use version::{MAX_VERSION, MIN_VERSION, VersionRange};
