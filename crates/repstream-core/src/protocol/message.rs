//! Replication stream messages
//!
//! Every message has a stable opcode and a body whose layout is a pure
//! function of the message and the session [`ProtocolContext`]. Fields that
//! were introduced at a later protocol version are skipped on both encode and
//! decode for older sessions; getting that symmetric is what keeps the rest
//! of the stream aligned.
//!
//! ```text
//! [opcode:i16][body_len:i32][body:body_len]      (big-endian)
//! ```

use super::context::ProtocolContext;
use super::version::{
    BEFORE_IMAGE_VERSION, DURABLE_VLSN_VERSION, ENTRY_REQUEST_MODE_VERSION, FILTER_STATS_VERSION,
    HEARTBEAT_ID_VERSION, SENDER_TIME_VERSION,
};
use crate::log::EntryType;
use crate::vlsn::Vlsn;
use crate::{Error, NodeId, Result, TxnId};
use bytes::{BufMut, Bytes, BytesMut};
use std::ops::RangeInclusive;

/// Opcode ranges; a session only accepts opcodes of its current range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubProtocol {
    /// Version negotiation
    Handshake,
    /// Matchpoint search and steady-state streaming
    Stream,
}

impl SubProtocol {
    /// Opcodes allocated to this sub-protocol
    pub const fn range(self) -> RangeInclusive<i16> {
        match self {
            Self::Handshake => 1..=19,
            Self::Stream => 100..=199,
        }
    }
}

/// Wire operation codes
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Consumer announces its version range
    ProtocolVersionRequest = 1,
    /// Feeder announces the negotiated version
    ProtocolVersionResponse = 2,
    /// Feeder refuses the session
    IncompatibleVersion = 3,
    /// Log entry
    Entry = 101,
    /// Consumer asks the feeder to start streaming
    StartStream = 102,
    /// Feeder liveness and progress
    Heartbeat = 103,
    /// Consumer liveness and progress
    HeartbeatResponse = 104,
    /// Commit entry, possibly requiring an ack
    Commit = 105,
    /// Single transaction ack
    Ack = 106,
    /// Batched transaction acks
    GroupAck = 107,
    /// Matchpoint probe
    EntryRequest = 108,
    /// Probe could not be satisfied
    EntryNotFound = 109,
    /// Alternate matchpoint proposal
    AltMatchpoint = 110,
    /// Consumer gives up on incremental sync
    RestoreRequest = 111,
    /// Peers able to serve a full copy
    RestoreResponse = 112,
    /// Feeder is shutting the stream down
    ShutdownRequest = 113,
    /// Consumer acknowledges shutdown
    ShutdownResponse = 114,
    /// Liveness ping during long scans
    Keepalive = 115,
    /// Echo of a keepalive
    KeepaliveResponse = 116,
    /// Database id lookup by name
    DbIdRequest = 117,
    /// Database id lookup result
    DbIdResponse = 118,
    /// Log entry with before-image
    EntryWithBeforeImage = 119,
}

impl Opcode {
    /// Sub-protocol the opcode belongs to
    pub fn sub_protocol(self) -> SubProtocol {
        if SubProtocol::Handshake.range().contains(&(self as i16)) {
            SubProtocol::Handshake
        } else {
            SubProtocol::Stream
        }
    }
}

impl TryFrom<i16> for Opcode {
    type Error = Error;

    fn try_from(value: i16) -> Result<Self> {
        match value {
            1 => Ok(Self::ProtocolVersionRequest),
            2 => Ok(Self::ProtocolVersionResponse),
            3 => Ok(Self::IncompatibleVersion),
            101 => Ok(Self::Entry),
            102 => Ok(Self::StartStream),
            103 => Ok(Self::Heartbeat),
            104 => Ok(Self::HeartbeatResponse),
            105 => Ok(Self::Commit),
            106 => Ok(Self::Ack),
            107 => Ok(Self::GroupAck),
            108 => Ok(Self::EntryRequest),
            109 => Ok(Self::EntryNotFound),
            110 => Ok(Self::AltMatchpoint),
            111 => Ok(Self::RestoreRequest),
            112 => Ok(Self::RestoreResponse),
            113 => Ok(Self::ShutdownRequest),
            114 => Ok(Self::ShutdownResponse),
            115 => Ok(Self::Keepalive),
            116 => Ok(Self::KeepaliveResponse),
            117 => Ok(Self::DbIdRequest),
            118 => Ok(Self::DbIdResponse),
            119 => Ok(Self::EntryWithBeforeImage),
            _ => Err(Error::protocol(format!("Unknown opcode: {}", value))),
        }
    }
}

/// How the feeder should treat an out-of-range matchpoint probe
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryRequestMode {
    /// Exact entry or nothing
    #[default]
    Default = 0,
    /// Nearest available entry
    Available = 1,
    /// Newest entry, ignoring the requested point
    Now = 2,
}

impl TryFrom<u8> for EntryRequestMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Default),
            1 => Ok(Self::Available),
            2 => Ok(Self::Now),
            _ => Err(Error::protocol(format!("Unknown entry request mode: {}", value))),
        }
    }
}

/// Replica-side sync policy carried by commits
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Neither write nor fsync before acking
    #[default]
    NoSync = 0,
    /// Write but don't fsync
    WriteNoSync = 1,
    /// Write and fsync
    Sync = 2,
}

impl TryFrom<u8> for SyncPolicy {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::NoSync),
            1 => Ok(Self::WriteNoSync),
            2 => Ok(Self::Sync),
            _ => Err(Error::protocol(format!("Unknown sync policy: {}", value))),
        }
    }
}

/// Kind of consumer on the other end of a feeder
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Full replica
    Replica = 0,
    /// Ack-only quorum participant
    Arbiter = 1,
    /// Filtered change subscriber
    Subscriber = 2,
}

impl TryFrom<u8> for NodeType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Replica),
            1 => Ok(Self::Arbiter),
            2 => Ok(Self::Subscriber),
            _ => Err(Error::protocol(format!("Unknown node type: {}", value))),
        }
    }
}

/// A peer able to serve a full network restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Group member name
    pub node_name: String,
    /// Host name
    pub host: String,
    /// Port
    pub port: u16,
}

/// Subscription filter counters reported by the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterStats {
    /// Entries that passed the filter
    pub passed: i64,
    /// Entries the filter dropped
    pub filtered: i64,
}

/// One log entry as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    /// Entry type tag
    pub entry_type: EntryType,
    /// Entry format version
    pub version: u8,
    /// Sequence number
    pub vlsn: Vlsn,
    /// Serialized entry
    pub payload: Bytes,
}

impl WireRecord {
    fn body_len(&self) -> usize {
        1 + 1 + 8 + 4 + self.payload.len()
    }

    fn encode(&self, ctx: &ProtocolContext, buf: &mut BytesMut) -> Result<()> {
        if self.version > ctx.stream_log_version {
            return Err(Error::protocol(format!(
                "Entry {} has format version {}, peer reads at most {}",
                self.vlsn, self.version, ctx.stream_log_version
            )));
        }
        let version = if ctx.fix_log_version_12_entries && self.version == 12 {
            13
        } else {
            self.version
        };
        buf.put_u8(self.entry_type as u8);
        buf.put_u8(version);
        buf.put_i64(self.vlsn.sequence());
        put_bytes(buf, &self.payload);
        Ok(())
    }

    fn decode(reader: &mut BodyReader<'_>) -> Result<Self> {
        let entry_type = EntryType::try_from(reader.u8()?)?;
        let version = reader.u8()?;
        let vlsn = reader.vlsn()?;
        let payload = reader.bytes()?;
        Ok(Self {
            entry_type,
            version,
            vlsn,
            payload,
        })
    }
}

/// Closed set of wire messages
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Consumer announces its versions and identity
    ProtocolVersionRequest {
        /// Lowest version the consumer speaks
        min_version: u16,
        /// Highest version the consumer speaks
        max_version: u16,
        /// Consumer node id
        node_id: NodeId,
        /// Consumer node name
        node_name: String,
        /// Consumer kind
        node_type: NodeType,
        /// Newest entry format the consumer reads
        log_version: u8,
    },

    /// Feeder accepts and fixes the session version
    ProtocolVersionResponse {
        /// Negotiated version
        version: u16,
        /// Feeder node id
        node_id: NodeId,
        /// Newest entry format the feeder writes
        log_version: u8,
    },

    /// Feeder refuses the session
    IncompatibleVersion {
        /// Why
        reason: String,
    },

    /// Log entry
    Entry {
        /// The entry
        record: WireRecord,
    },

    /// Log entry with the prior value of the record (version 15+)
    EntryWithBeforeImage {
        /// The entry
        record: WireRecord,
        /// Serialized before-image
        before_image: Bytes,
    },

    /// Begin streaming at `vlsn`
    StartStream {
        /// First sequence number to send
        vlsn: Vlsn,
        /// Opaque serialized subscription filter
        filter: Option<Bytes>,
    },

    /// Feeder heartbeat
    Heartbeat {
        /// Feeder clock, ms since the epoch
        master_now_ms: i64,
        /// Feeder's newest transaction end
        current_txn_end_vlsn: Vlsn,
        /// Echoed by the response (version 11+)
        heartbeat_id: i64,
    },

    /// Consumer heartbeat response
    HeartbeatResponse {
        /// Newest entry the consumer has received
        sync_up_vlsn: Vlsn,
        /// Newest transaction end the consumer has applied
        txn_end_vlsn: Vlsn,
        /// Id of the heartbeat being answered (version 11+)
        heartbeat_id: i64,
        /// Subscription filter counters (version 12+)
        filter_stats: FilterStats,
        /// Consumer clock, ms since the epoch (version 13+)
        sender_time_ms: i64,
        /// Newest entry durable on the consumer (version 14+)
        local_durable_vlsn: Vlsn,
    },

    /// Commit entry
    Commit {
        /// The consumer must ack this transaction
        needs_ack: bool,
        /// Consumer-side sync before acking
        sync_policy: SyncPolicy,
        /// The commit entry
        record: WireRecord,
    },

    /// Acknowledgment of one transaction
    Ack {
        /// Acknowledged transaction
        txn_id: TxnId,
        /// Newest entry durable on the consumer (version 14+)
        local_durable_vlsn: Vlsn,
    },

    /// Acknowledgment of several transactions
    GroupAck {
        /// Acknowledged transactions
        txn_ids: Vec<TxnId>,
    },

    /// Matchpoint probe
    EntryRequest {
        /// Requested entry
        vlsn: Vlsn,
        /// Out-of-range handling (version 7+)
        mode: EntryRequestMode,
    },

    /// The requested entry cannot be supplied
    EntryNotFound,

    /// The feeder proposes a different starting point
    AltMatchpoint {
        /// Entry at the proposed point
        record: WireRecord,
    },

    /// Consumer asks for restore candidates
    RestoreRequest {
        /// Point at which incremental sync failed
        failed_vlsn: Vlsn,
    },

    /// Restore candidates
    RestoreResponse {
        /// Group-wide durable point the restored copy must reach
        cbvlsn: Vlsn,
        /// Peers able to serve the copy
        peers: Vec<PeerInfo>,
    },

    /// Feeder is shutting the stream down
    ShutdownRequest {
        /// Feeder clock at shutdown
        shutdown_time_ms: i64,
    },

    /// Consumer acknowledges shutdown
    ShutdownResponse,

    /// Liveness ping during long scans
    Keepalive {
        /// Echo id
        id: i64,
    },

    /// Keepalive echo
    KeepaliveResponse {
        /// Id being echoed
        id: i64,
    },

    /// Database id lookup
    DbIdRequest {
        /// Database name
        db_name: String,
    },

    /// Database id lookup result; `db_id` is -1 when unknown
    DbIdResponse {
        /// Database name
        db_name: String,
        /// Database id
        db_id: i64,
    },
}

impl Message {
    /// Opcode of the message
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::ProtocolVersionRequest { .. } => Opcode::ProtocolVersionRequest,
            Self::ProtocolVersionResponse { .. } => Opcode::ProtocolVersionResponse,
            Self::IncompatibleVersion { .. } => Opcode::IncompatibleVersion,
            Self::Entry { .. } => Opcode::Entry,
            Self::EntryWithBeforeImage { .. } => Opcode::EntryWithBeforeImage,
            Self::StartStream { .. } => Opcode::StartStream,
            Self::Heartbeat { .. } => Opcode::Heartbeat,
            Self::HeartbeatResponse { .. } => Opcode::HeartbeatResponse,
            Self::Commit { .. } => Opcode::Commit,
            Self::Ack { .. } => Opcode::Ack,
            Self::GroupAck { .. } => Opcode::GroupAck,
            Self::EntryRequest { .. } => Opcode::EntryRequest,
            Self::EntryNotFound => Opcode::EntryNotFound,
            Self::AltMatchpoint { .. } => Opcode::AltMatchpoint,
            Self::RestoreRequest { .. } => Opcode::RestoreRequest,
            Self::RestoreResponse { .. } => Opcode::RestoreResponse,
            Self::ShutdownRequest { .. } => Opcode::ShutdownRequest,
            Self::ShutdownResponse => Opcode::ShutdownResponse,
            Self::Keepalive { .. } => Opcode::Keepalive,
            Self::KeepaliveResponse { .. } => Opcode::KeepaliveResponse,
            Self::DbIdRequest { .. } => Opcode::DbIdRequest,
            Self::DbIdResponse { .. } => Opcode::DbIdResponse,
        }
    }

    /// Exact body size at the context's version
    pub fn body_len(&self, ctx: &ProtocolContext) -> usize {
        match self {
            Self::ProtocolVersionRequest { node_name, .. } => 2 + 2 + 4 + string_len(node_name) + 1 + 1,
            Self::ProtocolVersionResponse { .. } => 2 + 4 + 1,
            Self::IncompatibleVersion { reason } => string_len(reason),
            Self::Entry { record } | Self::AltMatchpoint { record } => record.body_len(),
            Self::EntryWithBeforeImage {
                record,
                before_image,
            } => record.body_len() + 4 + before_image.len(),
            Self::StartStream { filter, .. } => 8 + 4 + filter.as_ref().map_or(0, Bytes::len),
            Self::Heartbeat { .. } => 8 + 8 + gated(ctx, HEARTBEAT_ID_VERSION, 8),
            Self::HeartbeatResponse { .. } => {
                8 + 8
                    + gated(ctx, HEARTBEAT_ID_VERSION, 8)
                    + gated(ctx, FILTER_STATS_VERSION, 16)
                    + gated(ctx, SENDER_TIME_VERSION, 8)
                    + gated(ctx, DURABLE_VLSN_VERSION, 8)
            }
            Self::Commit { record, .. } => 1 + 1 + record.body_len(),
            Self::Ack { .. } => 8 + gated(ctx, DURABLE_VLSN_VERSION, 8),
            Self::GroupAck { txn_ids } => 4 + 8 * txn_ids.len(),
            Self::EntryRequest { .. } => 8 + gated(ctx, ENTRY_REQUEST_MODE_VERSION, 1),
            Self::EntryNotFound | Self::ShutdownResponse => 0,
            Self::RestoreRequest { .. } => 8,
            Self::RestoreResponse { peers, .. } => {
                8 + 4
                    + peers
                        .iter()
                        .map(|p| string_len(&p.node_name) + string_len(&p.host) + 2)
                        .sum::<usize>()
            }
            Self::ShutdownRequest { .. } => 8,
            Self::Keepalive { .. } | Self::KeepaliveResponse { .. } => 8,
            Self::DbIdRequest { db_name } => string_len(db_name),
            Self::DbIdResponse { db_name, .. } => string_len(db_name) + 8,
        }
    }

    /// Append the body to `buf`
    pub fn encode_body(&self, ctx: &ProtocolContext, buf: &mut BytesMut) -> Result<()> {
        let start = buf.len();
        match self {
            Self::ProtocolVersionRequest {
                min_version,
                max_version,
                node_id,
                node_name,
                node_type,
                log_version,
            } => {
                buf.put_u16(*min_version);
                buf.put_u16(*max_version);
                buf.put_u32(*node_id);
                put_string(buf, node_name)?;
                buf.put_u8(*node_type as u8);
                buf.put_u8(*log_version);
            }
            Self::ProtocolVersionResponse {
                version,
                node_id,
                log_version,
            } => {
                buf.put_u16(*version);
                buf.put_u32(*node_id);
                buf.put_u8(*log_version);
            }
            Self::IncompatibleVersion { reason } => put_string(buf, reason)?,
            Self::Entry { record } | Self::AltMatchpoint { record } => record.encode(ctx, buf)?,
            Self::EntryWithBeforeImage {
                record,
                before_image,
            } => {
                if !ctx.supports(BEFORE_IMAGE_VERSION) {
                    return Err(Error::protocol(format!(
                        "Before-images need protocol version {}, session uses {}",
                        BEFORE_IMAGE_VERSION, ctx.version
                    )));
                }
                record.encode(ctx, buf)?;
                put_bytes(buf, before_image);
            }
            Self::StartStream { vlsn, filter } => {
                buf.put_i64(vlsn.sequence());
                match filter {
                    Some(filter) => put_bytes(buf, filter),
                    None => buf.put_i32(-1),
                }
            }
            Self::Heartbeat {
                master_now_ms,
                current_txn_end_vlsn,
                heartbeat_id,
            } => {
                buf.put_i64(*master_now_ms);
                buf.put_i64(current_txn_end_vlsn.sequence());
                if ctx.supports(HEARTBEAT_ID_VERSION) {
                    buf.put_i64(*heartbeat_id);
                }
            }
            Self::HeartbeatResponse {
                sync_up_vlsn,
                txn_end_vlsn,
                heartbeat_id,
                filter_stats,
                sender_time_ms,
                local_durable_vlsn,
            } => {
                buf.put_i64(sync_up_vlsn.sequence());
                buf.put_i64(txn_end_vlsn.sequence());
                if ctx.supports(HEARTBEAT_ID_VERSION) {
                    buf.put_i64(*heartbeat_id);
                }
                if ctx.supports(FILTER_STATS_VERSION) {
                    buf.put_i64(filter_stats.passed);
                    buf.put_i64(filter_stats.filtered);
                }
                if ctx.supports(SENDER_TIME_VERSION) {
                    buf.put_i64(*sender_time_ms);
                }
                if ctx.supports(DURABLE_VLSN_VERSION) {
                    buf.put_i64(local_durable_vlsn.sequence());
                }
            }
            Self::Commit {
                needs_ack,
                sync_policy,
                record,
            } => {
                buf.put_u8(u8::from(*needs_ack));
                buf.put_u8(*sync_policy as u8);
                record.encode(ctx, buf)?;
            }
            Self::Ack {
                txn_id,
                local_durable_vlsn,
            } => {
                buf.put_i64(*txn_id);
                if ctx.supports(DURABLE_VLSN_VERSION) {
                    buf.put_i64(local_durable_vlsn.sequence());
                }
            }
            Self::GroupAck { txn_ids } => {
                buf.put_i32(txn_ids.len() as i32);
                for txn_id in txn_ids {
                    buf.put_i64(*txn_id);
                }
            }
            Self::EntryRequest { vlsn, mode } => {
                buf.put_i64(vlsn.sequence());
                if ctx.supports(ENTRY_REQUEST_MODE_VERSION) {
                    buf.put_u8(*mode as u8);
                }
            }
            Self::EntryNotFound | Self::ShutdownResponse => {}
            Self::RestoreRequest { failed_vlsn } => buf.put_i64(failed_vlsn.sequence()),
            Self::RestoreResponse { cbvlsn, peers } => {
                buf.put_i64(cbvlsn.sequence());
                buf.put_i32(peers.len() as i32);
                for peer in peers {
                    put_string(buf, &peer.node_name)?;
                    put_string(buf, &peer.host)?;
                    buf.put_u16(peer.port);
                }
            }
            Self::ShutdownRequest { shutdown_time_ms } => buf.put_i64(*shutdown_time_ms),
            Self::Keepalive { id } | Self::KeepaliveResponse { id } => buf.put_i64(*id),
            Self::DbIdRequest { db_name } => put_string(buf, db_name)?,
            Self::DbIdResponse { db_name, db_id } => {
                put_string(buf, db_name)?;
                buf.put_i64(*db_id);
            }
        }
        debug_assert_eq!(buf.len() - start, self.body_len(ctx), "{:?}", self.opcode());
        Ok(())
    }

    /// Decode a body; the whole slice must be consumed
    pub fn decode_body(opcode: Opcode, body: &[u8], ctx: &ProtocolContext) -> Result<Self> {
        let mut r = BodyReader::new(opcode, body);
        let message = match opcode {
            Opcode::ProtocolVersionRequest => Self::ProtocolVersionRequest {
                min_version: r.u16()?,
                max_version: r.u16()?,
                node_id: r.u32()?,
                node_name: r.string()?,
                node_type: NodeType::try_from(r.u8()?)?,
                log_version: r.u8()?,
            },
            Opcode::ProtocolVersionResponse => Self::ProtocolVersionResponse {
                version: r.u16()?,
                node_id: r.u32()?,
                log_version: r.u8()?,
            },
            Opcode::IncompatibleVersion => Self::IncompatibleVersion {
                reason: r.string()?,
            },
            Opcode::Entry => Self::Entry {
                record: WireRecord::decode(&mut r)?,
            },
            Opcode::EntryWithBeforeImage => {
                if !ctx.supports(BEFORE_IMAGE_VERSION) {
                    return Err(Error::protocol(format!(
                        "Before-image entry received on a version {} session",
                        ctx.version
                    )));
                }
                Self::EntryWithBeforeImage {
                    record: WireRecord::decode(&mut r)?,
                    before_image: r.bytes()?,
                }
            }
            Opcode::StartStream => Self::StartStream {
                vlsn: r.vlsn()?,
                filter: r.optional_bytes()?,
            },
            Opcode::Heartbeat => Self::Heartbeat {
                master_now_ms: r.i64()?,
                current_txn_end_vlsn: r.vlsn()?,
                heartbeat_id: r.i64_since(ctx, HEARTBEAT_ID_VERSION, 0)?,
            },
            Opcode::HeartbeatResponse => Self::HeartbeatResponse {
                sync_up_vlsn: r.vlsn()?,
                txn_end_vlsn: r.vlsn()?,
                heartbeat_id: r.i64_since(ctx, HEARTBEAT_ID_VERSION, 0)?,
                filter_stats: if ctx.supports(FILTER_STATS_VERSION) {
                    FilterStats {
                        passed: r.i64()?,
                        filtered: r.i64()?,
                    }
                } else {
                    FilterStats::default()
                },
                sender_time_ms: r.i64_since(ctx, SENDER_TIME_VERSION, 0)?,
                local_durable_vlsn: Vlsn::new(r.i64_since(
                    ctx,
                    DURABLE_VLSN_VERSION,
                    Vlsn::NULL.sequence(),
                )?),
            },
            Opcode::Commit => Self::Commit {
                needs_ack: r.bool()?,
                sync_policy: SyncPolicy::try_from(r.u8()?)?,
                record: WireRecord::decode(&mut r)?,
            },
            Opcode::Ack => Self::Ack {
                txn_id: r.i64()?,
                local_durable_vlsn: Vlsn::new(r.i64_since(
                    ctx,
                    DURABLE_VLSN_VERSION,
                    Vlsn::NULL.sequence(),
                )?),
            },
            Opcode::GroupAck => {
                let count = r.count()?;
                let mut txn_ids = Vec::with_capacity(count.min(r.remaining() / 8));
                for _ in 0..count {
                    txn_ids.push(r.i64()?);
                }
                Self::GroupAck { txn_ids }
            }
            Opcode::EntryRequest => Self::EntryRequest {
                vlsn: r.vlsn()?,
                mode: if ctx.supports(ENTRY_REQUEST_MODE_VERSION) {
                    EntryRequestMode::try_from(r.u8()?)?
                } else {
                    EntryRequestMode::Default
                },
            },
            Opcode::EntryNotFound => Self::EntryNotFound,
            Opcode::AltMatchpoint => Self::AltMatchpoint {
                record: WireRecord::decode(&mut r)?,
            },
            Opcode::RestoreRequest => Self::RestoreRequest {
                failed_vlsn: r.vlsn()?,
            },
            Opcode::RestoreResponse => {
                let cbvlsn = r.vlsn()?;
                let count = r.count()?;
                let mut peers = Vec::with_capacity(count.min(16));
                for _ in 0..count {
                    peers.push(PeerInfo {
                        node_name: r.string()?,
                        host: r.string()?,
                        port: r.u16()?,
                    });
                }
                Self::RestoreResponse { cbvlsn, peers }
            }
            Opcode::ShutdownRequest => Self::ShutdownRequest {
                shutdown_time_ms: r.i64()?,
            },
            Opcode::ShutdownResponse => Self::ShutdownResponse,
            Opcode::Keepalive => Self::Keepalive { id: r.i64()? },
            Opcode::KeepaliveResponse => Self::KeepaliveResponse { id: r.i64()? },
            Opcode::DbIdRequest => Self::DbIdRequest {
                db_name: r.string()?,
            },
            Opcode::DbIdResponse => Self::DbIdResponse {
                db_name: r.string()?,
                db_id: r.i64()?,
            },
        };
        r.finish()?;
        Ok(message)
    }

    /// The message as a peer at `ctx.version` decodes it: fields introduced
    /// after that version take their defaults.
    pub fn as_seen_at(&self, ctx: &ProtocolContext) -> Self {
        let mut message = self.clone();
        match &mut message {
            Self::Heartbeat { heartbeat_id, .. } => {
                if !ctx.supports(HEARTBEAT_ID_VERSION) {
                    *heartbeat_id = 0;
                }
            }
            Self::HeartbeatResponse {
                heartbeat_id,
                filter_stats,
                sender_time_ms,
                local_durable_vlsn,
                ..
            } => {
                if !ctx.supports(HEARTBEAT_ID_VERSION) {
                    *heartbeat_id = 0;
                }
                if !ctx.supports(FILTER_STATS_VERSION) {
                    *filter_stats = FilterStats::default();
                }
                if !ctx.supports(SENDER_TIME_VERSION) {
                    *sender_time_ms = 0;
                }
                if !ctx.supports(DURABLE_VLSN_VERSION) {
                    *local_durable_vlsn = Vlsn::NULL;
                }
            }
            Self::Ack {
                local_durable_vlsn, ..
            } => {
                if !ctx.supports(DURABLE_VLSN_VERSION) {
                    *local_durable_vlsn = Vlsn::NULL;
                }
            }
            Self::EntryRequest { mode, .. } => {
                if !ctx.supports(ENTRY_REQUEST_MODE_VERSION) {
                    *mode = EntryRequestMode::Default;
                }
            }
            _ => {}
        }
        message
    }
}

fn gated(ctx: &ProtocolContext, introduced: u16, len: usize) -> usize {
    if ctx.supports(introduced) { len } else { 0 }
}

fn string_len(s: &str) -> usize {
    2 + s.len()
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| Error::protocol(format!("String of {} bytes is too long", s.len())))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(bytes);
}

/// Bounds-checked reader over one message body
struct BodyReader<'a> {
    opcode: Opcode,
    buf: &'a [u8],
}

impl<'a> BodyReader<'a> {
    fn new(opcode: Opcode, buf: &'a [u8]) -> Self {
        Self { opcode, buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() < len {
            return Err(Error::protocol(format!(
                "{:?} body truncated: needed {} more bytes, {} left",
                self.opcode,
                len,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::protocol(format!(
                "{:?} has invalid boolean {}",
                self.opcode, other
            ))),
        }
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn i64_since(&mut self, ctx: &ProtocolContext, introduced: u16, default: i64) -> Result<i64> {
        if ctx.supports(introduced) {
            self.i64()
        } else {
            Ok(default)
        }
    }

    fn vlsn(&mut self) -> Result<Vlsn> {
        Ok(Vlsn::new(self.i64()?))
    }

    fn count(&mut self) -> Result<usize> {
        let count = self.i32()?;
        usize::try_from(count)
            .map_err(|_| Error::protocol(format!("{:?} has negative count {}", self.opcode, count)))
    }

    fn bytes(&mut self) -> Result<Bytes> {
        let len = self.count()?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn optional_bytes(&mut self) -> Result<Option<Bytes>> {
        match self.i32()? {
            -1 => Ok(None),
            len if len < 0 => Err(Error::protocol(format!(
                "{:?} has invalid length {}",
                self.opcode, len
            ))),
            len => Ok(Some(Bytes::copy_from_slice(self.take(len as usize)?))),
        }
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::protocol(format!("{:?} has a non UTF-8 string", self.opcode)))
    }

    fn finish(self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "{:?} body has {} trailing bytes",
                self.opcode,
                self.buf.len()
            )))
        }
    }
}
