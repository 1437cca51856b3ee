//! Codec integration tests
//!
//! Exercise the fragment/reassembly pipeline end to end, including the
//! round-trip property: for all payloads and MTUs, fragmenting and then
//! reassembling in any interleaving/duplication order yields exactly the
//! original payload, exactly once.
//!
//! Run with: cargo test --test integration_codec_pipeline

use std::time::Instant;

use proptest::prelude::*;

use weft_core::codec::chunk::ChunkMessage;
use weft_core::codec::envelope::FragmentEnvelope;
use weft_core::codec::reassembly::{InsertOutcome, ReassemblyStore};
use weft_core::codec::{payload_type, Inbound, InboundCodec};

fn payload_mtu_order() -> impl Strategy<Value = (Vec<u8>, usize, Vec<usize>)> {
    (
        proptest::collection::vec(any::<u8>(), 0..1500),
        (FragmentEnvelope::HEADER_LEN + 1)..256,
    )
        .prop_flat_map(|(payload, mtu)| {
            let budget = mtu - FragmentEnvelope::HEADER_LEN;
            let count = payload.len().div_ceil(budget).max(1);
            // Every index twice: covers duplication under any interleaving
            let order: Vec<usize> = (0..count).chain(0..count).collect();
            (Just(payload), Just(mtu), Just(order).prop_shuffle())
        })
}

proptest! {
    #[test]
    fn prop_fragment_reassemble_any_order((payload, mtu, order) in payload_mtu_order()) {
        let fragments =
            FragmentEnvelope::fragment_payload([11u8; 8], &payload, mtu, 7, payload_type::BINARY, None)
                .expect("fragmentation");
        let now = Instant::now();
        let mut store = ReassemblyStore::new();

        let mut completions = 0;
        for i in order {
            if store.insert_envelope(&fragments[i], now) == InsertOutcome::Completed {
                completions += 1;
            }
        }

        prop_assert_eq!(completions, 1);
        let reassembled = store
            .take_completed(&hex::encode([11u8; 8]))
            .expect("completed payload");
        prop_assert_eq!(reassembled.bytes, payload);

        // Re-submitting any fragment of a completed id is a no-op
        prop_assert_eq!(
            store.insert_envelope(&fragments[0], now),
            InsertOutcome::AlreadyCompleted
        );
    }
}

#[test]
fn five_chunk_reorder_with_duplicate_completes_once() {
    // A 5-chunk text message at MTU 20-equivalent arrives with one chunk
    // duplicated and the last missing piece arriving at the end.
    let text = "abcdefghij".repeat(5);
    // Overhead for id "m-5" is 18 bytes, so MTU 28 gives 10 content bytes
    let chunks = ChunkMessage::chunk_text("m-5", &text, false, 28).expect("chunking");
    assert_eq!(chunks.len(), 5);

    let mut codec = InboundCodec::new("local");
    let now = Instant::now();

    // 0-indexed arrival order [1,3,3,2,4,5,0] from the scenario, minus one
    let order = [0usize, 2, 2, 1, 3];
    for &i in &order {
        let result = codec.classify(chunks[i].encode().as_bytes(), now);
        assert!(
            !matches!(result, Inbound::PayloadReady(_)),
            "must not complete before the last chunk"
        );
    }

    match codec.classify(chunks[4].encode().as_bytes(), now) {
        Inbound::PayloadReady(payload) => assert_eq!(payload.bytes, text.as_bytes()),
        other => panic!("expected completion, got {:?}", other),
    }

    // The duplicate id after completion stays completed-once
    let result = codec.classify(chunks[4].encode().as_bytes(), now);
    assert!(matches!(result, Inbound::Dropped(_)));
}

#[test]
fn ttl_strictly_decreases_per_hop_and_dies_at_one() {
    let env = FragmentEnvelope::new(
        [1u8; 8],
        0,
        2,
        3,
        payload_type::TEXT,
        Some("far-node".to_string()),
        b"x".to_vec(),
    )
    .unwrap();

    // Hop 1: codec on some relay node
    let mut hop1 = InboundCodec::new("relay-1");
    let bytes = env.to_bytes().unwrap();
    let forwarded = match hop1.classify(&bytes, Instant::now()) {
        Inbound::Relay { bytes, ttl, .. } => {
            assert_eq!(ttl, 2);
            bytes
        }
        other => panic!("expected relay, got {:?}", other),
    };

    // Hop 2: another relay node; TTL drops to 1 and dies there
    let mut hop2 = InboundCodec::new("relay-2");
    let forwarded2 = match hop2.classify(&forwarded, Instant::now()) {
        Inbound::Relay { bytes, ttl, .. } => {
            assert_eq!(ttl, 1);
            bytes
        }
        other => panic!("expected relay, got {:?}", other),
    };

    // Hop 3: TTL 1 is terminal — absorbed, never forwarded
    let mut hop3 = InboundCodec::new("relay-3");
    assert!(matches!(
        hop3.classify(&forwarded2, Instant::now()),
        Inbound::Dropped(_)
    ));
}

#[test]
fn envelope_survives_mixed_traffic() {
    // A realistic inbound mix: pings, garbage, chunks, envelopes
    let mut codec = InboundCodec::new("local");
    let now = Instant::now();

    assert_eq!(codec.classify(&[0x00], now), Inbound::Ping);
    assert!(matches!(codec.classify(&[0xFF, 0x13], now), Inbound::Dropped(_)));

    let fragments = FragmentEnvelope::fragment_payload(
        [9u8; 8],
        b"payload for local",
        48,
        5,
        payload_type::BINARY,
        Some("local"),
    )
    .unwrap();

    let mut done = false;
    for frag in &fragments {
        // Interleave noise between fragments
        assert_eq!(codec.classify(&[0x00, 0x00], now), Inbound::Ping);
        if let Inbound::PayloadReady(p) = codec.classify(&frag.to_bytes().unwrap(), now) {
            assert_eq!(p.bytes, b"payload for local");
            done = true;
        }
    }
    assert!(done);
}
