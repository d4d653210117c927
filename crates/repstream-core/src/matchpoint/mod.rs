//! Matchpoint negotiation
//!
//! Before streaming, feeder and consumer agree on the newest sequence number
//! at which their logs are identical. The feeder answers probes
//! ([`feeder::FeederSyncup`]) using a pure decision table
//! ([`decision::decide`]); the consumer drives the probing
//! ([`replica::ReplicaSyncup`], [`replica::SubscriberSyncup`]).

pub mod decision;
pub mod feeder;
pub mod replica;

pub use decision::{Decision, EntryProbe, decide};
pub use feeder::{DbIdLookup, FeederSyncup, RestorePeers, SyncupOutcome};
pub use replica::{LocalLog, ReplicaSyncup, SubscriberSyncup, request_db_id};
