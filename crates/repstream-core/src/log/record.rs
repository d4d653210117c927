//! Log entries as the engine sees them

use crate::feed::cache::CachedItemRef;
use crate::protocol::WireRecord;
use crate::vlsn::{Lsn, Vlsn};
use crate::{Error, Result, TxnId};
use bytes::Bytes;
use crc32fast::Hasher;

/// Replicated entry types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    /// Data change
    Data = 1,
    /// Transaction commit
    TxnCommit = 2,
    /// Transaction abort
    TxnAbort = 3,
    /// Explicit matchpoint marker
    Matchpoint = 4,
    /// Database naming change
    NameLn = 5,
    /// Diagnostic trace
    Trace = 6,
}

impl EntryType {
    /// Commit, abort or matchpoint: a candidate start point for streaming
    pub fn is_sync_point(self) -> bool {
        matches!(self, Self::TxnCommit | Self::TxnAbort | Self::Matchpoint)
    }

    /// Commit or abort
    pub fn is_txn_end(self) -> bool {
        matches!(self, Self::TxnCommit | Self::TxnAbort)
    }
}

impl TryFrom<u8> for EntryType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Data),
            2 => Ok(Self::TxnCommit),
            3 => Ok(Self::TxnAbort),
            4 => Ok(Self::Matchpoint),
            5 => Ok(Self::NameLn),
            6 => Ok(Self::Trace),
            _ => Err(Error::protocol(format!("Unknown entry type: {}", value))),
        }
    }
}

/// Entry bytes, either owned or borrowed from the item cache
#[derive(Debug, Clone)]
pub enum RecordPayload {
    /// Copied out of a buffer or read from disk
    Owned(Bytes),
    /// Shared with the item cache; the guard holds a use count
    Cached(CachedItemRef),
}

impl RecordPayload {
    /// Payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => bytes,
            Self::Cached(item) => &item.payload,
        }
    }

    /// Payload as a cheap `Bytes` handle
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Owned(bytes) => bytes.clone(),
            Self::Cached(item) => item.payload.clone(),
        }
    }

    /// Whether the bytes are shared with the item cache
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

/// A log entry with its position and payload
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Entry type
    pub entry_type: EntryType,
    /// Entry format version
    pub version: u8,
    /// Sequence number
    pub vlsn: Vlsn,
    /// Physical position; NULL for entries that arrived over the wire
    pub lsn: Lsn,
    /// Rolled back entry, skipped by scans
    pub invisible: bool,
    /// Serialized entry
    pub payload: RecordPayload,
    /// Prior value of the changed record, when tracked
    pub before_image: Option<Bytes>,
}

impl LogRecord {
    /// Record with an owned payload at an unknown position
    pub fn new(entry_type: EntryType, version: u8, vlsn: Vlsn, payload: Bytes) -> Self {
        Self {
            entry_type,
            version,
            vlsn,
            lsn: Lsn::NULL,
            invisible: false,
            payload: RecordPayload::Owned(payload),
            before_image: None,
        }
    }

    /// Record backed by a cached item
    pub fn from_cached(item: CachedItemRef) -> Self {
        Self {
            entry_type: item.entry_type,
            version: item.version,
            vlsn: item.vlsn,
            lsn: Lsn::NULL,
            invisible: false,
            before_image: item.before_image.clone(),
            payload: RecordPayload::Cached(item),
        }
    }

    /// Attach a before-image
    pub fn with_before_image(mut self, before_image: Bytes) -> Self {
        self.before_image = Some(before_image);
        self
    }

    /// Payload size in bytes
    pub fn item_size(&self) -> usize {
        self.payload.as_bytes().len()
    }

    /// Transaction id of a commit or abort
    pub fn txn_id(&self) -> Option<TxnId> {
        if !self.entry_type.is_txn_end() {
            return None;
        }
        let bytes = self.payload.as_bytes();
        let head: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(TxnId::from_be_bytes(head))
    }

    /// Checksum over type and payload; format version is excluded so
    /// relabelled entries still compare equal
    pub fn checksum(&self) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&[self.entry_type as u8]);
        hasher.update(&self.vlsn.sequence().to_be_bytes());
        hasher.update(self.payload.as_bytes());
        hasher.finalize()
    }

    /// Same entry type and checksum
    pub fn matches(&self, other: &LogRecord) -> bool {
        self.entry_type == other.entry_type
            && self.vlsn == other.vlsn
            && self.checksum() == other.checksum()
    }

    /// Wire form of the entry
    pub fn to_wire(&self) -> WireRecord {
        WireRecord {
            entry_type: self.entry_type,
            version: self.version,
            vlsn: self.vlsn,
            payload: self.payload.to_bytes(),
        }
    }

    /// Entry received over the wire
    pub fn from_wire(record: WireRecord) -> Self {
        Self::new(record.entry_type, record.version, record.vlsn, record.payload)
    }

    /// Copy the payload out of the cache, releasing the use count
    pub fn detach(mut self) -> Self {
        if let RecordPayload::Cached(item) = &self.payload {
            let bytes = item.payload.clone();
            self.payload = RecordPayload::Owned(bytes);
        }
        self
    }
}

/// Payload of a commit or abort: transaction id followed by opaque bytes
pub fn txn_end_payload(txn_id: TxnId, rest: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(8 + rest.len());
    buf.extend_from_slice(&txn_id.to_be_bytes());
    buf.extend_from_slice(rest);
    Bytes::from(buf)
}
