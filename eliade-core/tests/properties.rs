//! Property tests for normalization, counting and ordering.

use eliade_core::normalize::scale_psd;
use eliade_core::pipeline::sort_by_timestamp;
use eliade_core::{
    Envelope, FlatEventRecord, Frame, FrameSource, FrameWriter, RawEvent, RecordNormalizer,
    SchemaVariant, VariantDecoder,
};
use proptest::prelude::*;
use std::io::Cursor;

fn arb_variant() -> impl Strategy<Value = SchemaVariant> {
    prop::sample::select(SchemaVariant::ALL.to_vec())
}

fn arb_event() -> impl Strategy<Value = RawEvent> {
    (
        any::<u8>(),
        any::<u8>(),
        any::<u64>(),
        any::<u16>(),
        0.0f32..1.0,
        prop::collection::vec(any::<u16>(), 0..16),
        prop::collection::vec(any::<u16>(), 0..16),
        any::<bool>(),
    )
        .prop_map(|(board, channel, timestamp, energy, psd, w1, w2, flag)| {
            RawEvent::new(board, channel, timestamp, energy)
                .with_psd(psd)
                .with_fine_timestamp(timestamp as f64 + 0.5)
                .with_flags(flag, !flag)
                .with_waveforms(w1, w2)
        })
}

fn arb_frames() -> impl Strategy<Value = Vec<(SchemaVariant, Vec<RawEvent>)>> {
    prop::collection::vec(
        (arb_variant(), prop::collection::vec(arb_event(), 0..8)),
        0..6,
    )
}

fn encode(frames: &[(SchemaVariant, Vec<RawEvent>)]) -> Vec<u8> {
    let mut writer = FrameWriter::new(Vec::new(), Envelope::Tagged);
    for (variant, events) in frames {
        writer.write_frame(*variant, events).unwrap();
    }
    writer.into_inner()
}

fn frames_of(bytes: Vec<u8>) -> Vec<Frame> {
    FrameSource::from_reader(Cursor::new(bytes), Envelope::Tagged)
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

proptest! {
    #[test]
    fn prop_psd_in_unit_range_scales_to_thousandths(psd in 0.0f32..=1.0) {
        let scaled = scale_psd(psd);
        prop_assert!(scaled <= 1000);
        prop_assert!((scaled as f64 - psd as f64 * 1000.0).abs() <= 0.5 + 1e-3);
    }

    #[test]
    fn prop_normalize_preserves_prefix(variant in arb_variant(), event in arb_event()) {
        let record = RecordNormalizer::default().normalize(variant, event.clone());
        prop_assert_eq!(record.module, event.board);
        prop_assert_eq!(record.channel, event.channel);
        prop_assert_eq!(record.timestamp, event.timestamp);
        prop_assert_eq!(record.charge_long, event.energy);
        prop_assert!(record.traces_consistent());
        if !variant.layout().psd {
            prop_assert_eq!(record.charge_short, 0);
        }
    }

    #[test]
    fn prop_count_matches_decode(frames in arb_frames()) {
        let decoder = VariantDecoder::new(Envelope::Tagged);
        for frame in frames_of(encode(&frames)) {
            let counted = decoder.count_frame(&frame).unwrap();
            let decoded = decoder.decode_frame(&frame).unwrap();
            prop_assert_eq!(counted.variant, decoded.variant);
            prop_assert_eq!(counted.events, decoded.events.len() as u64);
        }
    }

    #[test]
    fn prop_decode_returns_written_events(frames in arb_frames()) {
        let decoder = VariantDecoder::new(Envelope::Tagged);
        let decoded = frames_of(encode(&frames));
        prop_assert_eq!(decoded.len(), frames.len());
        for (frame, (variant, events)) in decoded.iter().zip(&frames) {
            let out = decoder.decode_frame(frame).unwrap();
            prop_assert_eq!(out.variant, Some(*variant));
            prop_assert_eq!(out.events.len(), events.len());
            for (got, sent) in out.events.iter().zip(events) {
                prop_assert_eq!(got.timestamp, sent.timestamp);
                prop_assert_eq!(got.board, sent.board);
                prop_assert_eq!(got.energy, sent.energy);
            }
        }
    }

    #[test]
    fn prop_sort_is_ordered_and_idempotent(
        stamps in prop::collection::vec(0u64..64, 0..200),
        parallel in any::<bool>(),
    ) {
        let mut records: Vec<FlatEventRecord> = stamps
            .iter()
            .enumerate()
            .map(|(i, &t)| FlatEventRecord {
                timestamp: t,
                extras: i as u32,
                ..Default::default()
            })
            .collect();
        sort_by_timestamp(&mut records, parallel);

        for pair in records.windows(2) {
            prop_assert!(pair[0].timestamp <= pair[1].timestamp);
            if pair[0].timestamp == pair[1].timestamp {
                prop_assert!(pair[0].extras < pair[1].extras);
            }
        }

        let once = records.clone();
        sort_by_timestamp(&mut records, parallel);
        prop_assert_eq!(records, once);
    }
}
