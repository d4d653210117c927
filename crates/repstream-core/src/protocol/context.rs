//! Per-session codec context
//!
//! Resolved once at handshake time and passed explicitly to every encode and
//! decode call; messages never reach back into session state.

use super::message::SubProtocol;
use super::version::{CURRENT_LOG_VERSION, FIX_LOG_VERSION_12_VERSION, MIN_VERSION};

/// Immutable snapshot of the negotiated wire parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolContext {
    /// Negotiated protocol version
    pub version: u16,
    /// Opcode range accepted on decode
    pub sub_protocol: SubProtocol,
    /// Highest entry format version the peer can read
    pub stream_log_version: u8,
    /// Relabel format 12 entries as format 13 on the way out
    pub fix_log_version_12_entries: bool,
}

impl ProtocolContext {
    /// Context used for the version handshake itself
    pub const fn handshake() -> Self {
        Self {
            version: MIN_VERSION,
            sub_protocol: SubProtocol::Handshake,
            stream_log_version: CURRENT_LOG_VERSION,
            fix_log_version_12_entries: false,
        }
    }

    /// Stream context for a negotiated version, peer reads current entries
    pub const fn stream(version: u16) -> Self {
        Self {
            version,
            sub_protocol: SubProtocol::Stream,
            stream_log_version: CURRENT_LOG_VERSION,
            fix_log_version_12_entries: false,
        }
    }

    /// Stream context derived from the handshake outcome
    pub fn negotiated(version: u16, peer_log_version: u8) -> Self {
        let stream_log_version = peer_log_version.min(CURRENT_LOG_VERSION);
        Self {
            version,
            sub_protocol: SubProtocol::Stream,
            stream_log_version,
            fix_log_version_12_entries: version < FIX_LOG_VERSION_12_VERSION
                && stream_log_version > 12,
        }
    }

    /// Whether a field introduced at `introduced` is on the wire
    pub const fn supports(&self, introduced: u16) -> bool {
        self.version >= introduced
    }
}

impl Default for ProtocolContext {
    fn default() -> Self {
        Self::handshake()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiated_context() {
        let ctx = ProtocolContext::negotiated(7, 14);
        assert_eq!(ctx.stream_log_version, 14);
        assert!(ctx.fix_log_version_12_entries);
        assert!(ctx.supports(7));
        assert!(!ctx.supports(11));

        let ctx = ProtocolContext::negotiated(15, 20);
        assert_eq!(ctx.stream_log_version, CURRENT_LOG_VERSION);
        assert!(!ctx.fix_log_version_12_entries);
    }
}
