//! Repstream Core - Replication Stream Engine
//!
//! This crate implements the streaming half of log-shipping replication:
//! - Versioned wire protocol with an explicit per-session context
//! - Matchpoint negotiation between a feeder and its consumers
//! - Log scanning over sequence-number indexes with gap recovery
//! - Record supply through an item cache, write buffers and disk
//! - Commit acknowledgment quorums and leader consistency checks
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   channel    ┌──────────────────────┐
//! │        Feeder        │◄────────────►│    Consumer          │
//! │ handshake, syncup,   │  protocol    │ handshake, syncup,   │
//! │ output + input loops │              │ StreamConsumer       │
//! └──────────┬───────────┘              └──────────┬───────────┘
//!            │                                     │
//! ┌──────────┴───────────┐              ┌──────────┴───────────┐
//! │ FeedSource, scanner, │              │ LocalLog (rollback,  │
//! │ AckTracker, leader   │              │ sync points)         │
//! └──────────┬───────────┘              └──────────────────────┘
//!            │
//! ┌──────────┴───────────┐
//! │ LogStore + VlsnIndex │
//! └──────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod acks;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod error;
pub mod feed;
pub mod feeder;
pub mod keepalive;
pub mod leader;
pub mod log;
pub mod matchpoint;
pub mod protocol;
pub mod vlsn;

pub use acks::{AckMode, AckPolicy, AckStats, AckTracker, CommitTxn};
pub use channel::{Channel, MemoryChannel, TcpChannel};
pub use config::StreamConfig;
pub use consumer::{StreamConsumer, StreamEvent};
pub use error::{Error, Result};
pub use feeder::{Feeder, FeederHandle, FeederStats};
pub use leader::{LeaderId, LeaderListener, LeaderStatusTracker, Proposal};
pub use vlsn::{Lsn, Vlsn, VlsnRange};

/// Transaction identifier carried by commits and acks
pub type TxnId = i64;

/// Node identifier within a replication group
pub type NodeId = u32;
