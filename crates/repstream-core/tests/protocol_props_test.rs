//! Codec properties across every supported protocol version

use bytes::Bytes;
use proptest::prelude::*;
use repstream_core::log::EntryType;
use repstream_core::protocol::codec::{decode_frame, encode_frame};
use repstream_core::protocol::version::{
    DURABLE_VLSN_VERSION, ENTRY_REQUEST_MODE_VERSION, HEARTBEAT_ID_VERSION,
};
use repstream_core::protocol::{
    EntryRequestMode, FilterStats, MAX_VERSION, MIN_VERSION, Message, ProtocolContext,
    SyncPolicy, WireRecord,
};
use repstream_core::Vlsn;

fn vlsn() -> impl Strategy<Value = Vlsn> {
    (1i64..1_000_000).prop_map(Vlsn::new)
}

fn mode() -> impl Strategy<Value = EntryRequestMode> {
    prop_oneof![
        Just(EntryRequestMode::Default),
        Just(EntryRequestMode::Available),
        Just(EntryRequestMode::Now),
    ]
}

fn record() -> impl Strategy<Value = WireRecord> {
    (vlsn(), proptest::collection::vec(any::<u8>(), 0..64)).prop_map(|(vlsn, payload)| {
        WireRecord {
            entry_type: EntryType::Data,
            version: 16,
            vlsn,
            payload: Bytes::from(payload),
        }
    })
}

/// Messages whose every field exists at some supported version
fn message() -> impl Strategy<Value = Message> {
    prop_oneof![
        (any::<i64>(), vlsn(), 1i64..i64::MAX).prop_map(|(now, txn_end, id)| Message::Heartbeat {
            master_now_ms: now,
            current_txn_end_vlsn: txn_end,
            heartbeat_id: id,
        }),
        (vlsn(), vlsn(), 1i64..1000, 0i64..1000, 0i64..1000, 1i64..i64::MAX, vlsn()).prop_map(
            |(sync_up, txn_end, id, passed, filtered, sent, durable)| Message::HeartbeatResponse {
                sync_up_vlsn: sync_up,
                txn_end_vlsn: txn_end,
                heartbeat_id: id,
                filter_stats: FilterStats { passed, filtered },
                sender_time_ms: sent,
                local_durable_vlsn: durable,
            }
        ),
        (any::<i64>(), vlsn()).prop_map(|(txn_id, durable)| Message::Ack {
            txn_id,
            local_durable_vlsn: durable,
        }),
        proptest::collection::vec(any::<i64>(), 0..16)
            .prop_map(|txn_ids| Message::GroupAck { txn_ids }),
        (vlsn(), mode()).prop_map(|(vlsn, mode)| Message::EntryRequest { vlsn, mode }),
        record().prop_map(|record| Message::Entry { record }),
        (any::<bool>(), record()).prop_map(|(needs_ack, record)| Message::Commit {
            needs_ack,
            sync_policy: SyncPolicy::WriteNoSync,
            record,
        }),
        any::<i64>().prop_map(|id| Message::Keepalive { id }),
    ]
}

proptest! {
    #[test]
    fn prop_decode_matches_view_at_version(
        msg in message(),
        version in MIN_VERSION..=MAX_VERSION,
    ) {
        let ctx = ProtocolContext::stream(version);
        let frame = encode_frame(&msg, &ctx).unwrap();
        let decoded = decode_frame(&frame, &ctx).unwrap();
        prop_assert_eq!(decoded, msg.as_seen_at(&ctx));
    }

    #[test]
    fn prop_gated_fields_absent_below_introduction(
        msg in message(),
        version in MIN_VERSION..=MAX_VERSION,
    ) {
        let ctx = ProtocolContext::stream(version);
        let full = encode_frame(&msg, &ProtocolContext::stream(MAX_VERSION)).unwrap();
        let frame = encode_frame(&msg, &ctx).unwrap();
        let shrink = full.len() - frame.len();
        let expected = match &msg {
            Message::Heartbeat { .. } => if version < HEARTBEAT_ID_VERSION { 8 } else { 0 },
            Message::Ack { .. } => if version < DURABLE_VLSN_VERSION { 8 } else { 0 },
            Message::EntryRequest { .. } => if version < ENTRY_REQUEST_MODE_VERSION { 1 } else { 0 },
            _ => shrink,
        };
        prop_assert_eq!(shrink, expected);
    }
}

#[test]
fn test_versions_below_mode_drop_request_mode() {
    let msg = Message::EntryRequest {
        vlsn: Vlsn::new(9),
        mode: EntryRequestMode::Now,
    };
    let ctx = ProtocolContext::stream(ENTRY_REQUEST_MODE_VERSION - 1);
    let decoded = decode_frame(&encode_frame(&msg, &ctx).unwrap(), &ctx).unwrap();
    assert_eq!(
        decoded,
        Message::EntryRequest {
            vlsn: Vlsn::new(9),
            mode: EntryRequestMode::Default,
        }
    );
}
