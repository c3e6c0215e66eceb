//! Property-based tests using proptest
//!
//! These tests validate protocol invariants across a wide range of randomly
//! generated inputs: packet and envelope encoding, resumable frame decoding
//! and load-balanced target selection.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use peer_relay::core::codec::{Frame, FrameCodec};
use peer_relay::core::packet::{self, PacketRegistry, PacketType, TaggedPayload};
use peer_relay::error::ProtocolError;
use peer_relay::protocol::{ConversationId, Envelope, TargetType};
use peer_relay::routing::registry::{ConnectionHandle, ConnectionRegistry, PeerRecord};
use peer_relay::routing::router;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Blob {
    label: String,
    data: Vec<u8>,
}

impl PacketType for Blob {
    const TAG: &'static str = "prop.blob";
}

fn target_type(index: u8) -> TargetType {
    match index % 5 {
        0 => TargetType::Direct,
        1 => TargetType::Type,
        2 => TargetType::LoadBalanced,
        3 => TargetType::Broadcast,
        _ => TargetType::Server,
    }
}

/// Feed `bytes` to `codec` in chunks of the given sizes, collecting frames
fn decode_in_chunks(codec: &mut FrameCodec, bytes: &[u8], chunks: &[usize]) -> Vec<Frame> {
    let mut buf = BytesMut::new();
    let mut frames = Vec::new();
    let mut offset = 0;
    let mut sizes = chunks.iter().cycle();
    while offset < bytes.len() {
        let step = (*sizes.next().unwrap()).min(bytes.len() - offset);
        buf.extend_from_slice(&bytes[offset..offset + step]);
        offset += step;
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
    }
    assert!(buf.is_empty(), "leftover bytes after final frame");
    frames
}

// Property: Any packet survives the tagged encoding
proptest! {
    #[test]
    fn prop_packet_roundtrip(
        label in ".{0,32}",
        data in prop::collection::vec(any::<u8>(), 0..4096),
    ) {
        let registry = PacketRegistry::builder().register::<Blob>().build();
        let blob = Blob { label, data };

        let bytes = packet::serialize(&blob).unwrap();
        prop_assert_eq!(packet::peek_tag(&bytes).unwrap(), Blob::TAG);

        let decoded = registry.deserialize(&bytes).unwrap();
        prop_assert_eq!(decoded.downcast_ref::<Blob>(), Some(&blob));
    }
}

// Property: Unregistered tags never decode
proptest! {
    #[test]
    fn prop_unknown_tag_rejected(
        tag in "[a-z]{1,12}\\.[a-z]{1,12}",
        body in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        prop_assume!(tag != Blob::TAG);
        let registry = PacketRegistry::builder().register::<Blob>().build();
        prop_assume!(!registry.contains(&tag));

        let bytes = bincode::serialize(&TaggedPayload { tag: tag.clone(), body }).unwrap();
        match registry.deserialize(&bytes) {
            Err(ProtocolError::UnknownPacketType(found)) => prop_assert_eq!(found, tag),
            other => prop_assert!(false, "expected UnknownPacketType, got {:?}", other),
        }
    }
}

// Property: Envelope metadata and payload survive encoding untouched
proptest! {
    #[test]
    fn prop_envelope_roundtrip(
        source in "[a-z0-9-]{1,16}",
        target in "[a-z0-9-]{0,16}",
        kind in any::<u8>(),
        id in any::<u64>(),
        data in prop::collection::vec(any::<u8>(), 0..1024),
    ) {
        let blob = Blob { label: String::new(), data };
        let envelope = Envelope::new(
            source,
            target,
            target_type(kind),
            ConversationId(id),
            &blob,
        ).unwrap();

        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(decoded, envelope);
    }
}

// Property: Frames decode identically however the stream is chunked
proptest! {
    #[test]
    fn prop_chunked_decode_matches(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..8),
        chunks in prop::collection::vec(1usize..64, 1..16),
        authenticated in any::<bool>(),
    ) {
        let mut encoder = FrameCodec::new();
        let mut decoder = FrameCodec::new();
        if authenticated {
            encoder.mark_authenticated();
            decoder.mark_authenticated();
        }

        let frames: Vec<Frame> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                if !authenticated && i % 2 == 0 {
                    Frame::handshake(payload)
                } else {
                    Frame::message(payload)
                }
            })
            .collect();

        let mut wire = BytesMut::new();
        for frame in &frames {
            encoder.encode(frame.clone(), &mut wire).unwrap();
        }

        let decoded = decode_in_chunks(&mut decoder, &wire, &chunks);
        prop_assert_eq!(decoded, frames);
    }
}

// Property: A strict prefix of a frame is never consumed
proptest! {
    #[test]
    fn prop_partial_frame_waits(
        payload in prop::collection::vec(any::<u8>(), 1..1024),
        cut in any::<prop::sample::Index>(),
    ) {
        let mut codec = FrameCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(Frame::message(payload), &mut wire).unwrap();

        let len = cut.index(wire.len());
        let mut partial = BytesMut::from(&wire[..len]);
        prop_assert_eq!(codec.decode(&mut partial).unwrap(), None);
        prop_assert_eq!(partial.len(), len);
    }
}

// Property: Load-balanced selection always picks the least recently written peer
proptest! {
    #[test]
    fn prop_load_balanced_picks_least_recent(
        members in 1usize..6,
        writes in prop::collection::vec(any::<prop::sample::Index>(), 0..32),
    ) {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        for i in 0..members {
            let (handle, rx) = ConnectionHandle::channel();
            receivers.push(rx);
            registry.add(PeerRecord::new(format!("peer-{i}"), "pool", handle)).unwrap();
        }

        // Position of each peer's latest write, None if never written
        let mut last_written: Vec<Option<usize>> = vec![None; members];
        let snapshot = registry.snapshot();
        for (step, pick) in writes.iter().enumerate() {
            let i = pick.index(members);
            registry.touch(&snapshot[i]);
            last_written[i] = Some(step);
        }

        let expected = (0..members)
            .min_by_key(|&i| last_written[i].map_or(0, |step| step + 1))
            .unwrap();
        let chosen = router::select(TargetType::LoadBalanced, "pool", &registry.snapshot());
        prop_assert_eq!(chosen.len(), 1);
        prop_assert_eq!(chosen[0].unique_id(), format!("peer-{expected}"));
    }
}
