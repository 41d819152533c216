//! Stream-oriented framer/decoder for the transmitter's binary protocol.
//!
//! Two framings share one resync loop: the tagged `"datiacquisiti"` block
//! (primary, production) and a legacy length-prefixed block (test-only).
//! Malformed input never aborts decoding — the buffer advances by one byte
//! and a gap counter increments, per spec.md S4.4.

use bench_registry::ChannelRegistry;
use byteorder::{BigEndian, ReadBytesExt};
use chrono::NaiveDateTime;
use std::io::Cursor;

pub const TAGGED_MARKER: &[u8] = b"datiacquisiti";
const TAGGED_FRAME_LEN: usize = 1132;
const TAGGED_PAYLOAD_OFFSET: usize = 60;
const TAGGED_COUNT_OFFSET: usize = 56;
const TAGGED_MARKER2_OFFSET: usize = 39;
const TAGGED_SEPARATOR_OFFSET: usize = 37;

const LEGACY_HEADER_LEN: usize = 20;
const LEGACY_MIN_TOTAL_LEN: usize = 28;
const LEGACY_MAX_TOTAL_LEN: usize = 65536;
const LEGACY_MAX_N: usize = 256;

pub const BUFFER_CAPACITY: usize = 16 * 1024;
pub const RESYNC_RETAIN: usize = 512;

/// Sentinel that the protocol uses to mark a channel as having no data.
const NO_DATA_SENTINEL: f64 = -99.0;
const NO_DATA_TOLERANCE: f64 = 0.01;

/// A decoded channel reading: either a real value or the distinguished
/// "no-data" marker (sentinel -99.0 within tolerance).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleValue {
    Valid(f64),
    NoData,
}

impl SampleValue {
    pub fn from_raw(raw: f64) -> SampleValue {
        if (raw - NO_DATA_SENTINEL).abs() <= NO_DATA_TOLERANCE {
            SampleValue::NoData
        } else {
            SampleValue::Valid(raw)
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, SampleValue::NoData)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedSample {
    pub channel_index: u16,
    pub value: SampleValue,
}

/// One decoded frame: all channel values carried by a single protocol
/// block, stamped with the wall-clock time of decoding and a monotone
/// sequence number (spec.md S4.5).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBatch {
    pub timestamp: NaiveDateTime,
    pub sequence: u64,
    pub samples: Vec<DecodedSample>,
}

/// Observable decoder counters (spec.md S7: "all counters observable via
/// a metrics snapshot").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub gap_count: u64,
    pub buffer_overflow_count: u64,
}

/// Stateful byte buffer implementing the resync loop. Single-threaded
/// within one pipeline (spec.md S4.4).
pub struct ProtocolDecoder {
    buf: Vec<u8>,
    sequence: u64,
    stats: DecoderStats,
}

impl Default for ProtocolDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolDecoder {
    pub fn new() -> Self {
        ProtocolDecoder {
            buf: Vec::with_capacity(BUFFER_CAPACITY),
            sequence: 0,
            stats: DecoderStats::default(),
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Appends `chunk` and extracts zero or more complete frames, in
    /// arrival order. `now` stamps every frame decoded during this call.
    pub fn feed(&mut self, chunk: &[u8], now: NaiveDateTime) -> Vec<DecodedBatch> {
        if chunk.is_empty() && self.buf.is_empty() {
            return Vec::new();
        }
        self.buf.extend_from_slice(chunk);

        if self.buf.len() > BUFFER_CAPACITY {
            let keep_from = self.buf.len() - RESYNC_RETAIN;
            self.buf.drain(0..keep_from);
            self.stats.buffer_overflow_count += 1;
            tracing::warn!(
                retained = self.buf.len(),
                "decoder buffer overflow, resyncing"
            );
        }

        let mut out = Vec::new();
        loop {
            if self.buf.is_empty() {
                break;
            }
            match self.try_extract_one() {
                Step::NeedMoreData => break,
                Step::Resync => {
                    self.buf.drain(0..1);
                    self.stats.gap_count += 1;
                }
                Step::Frame { consumed, samples } => {
                    self.buf.drain(0..consumed);
                    self.sequence += 1;
                    self.stats.frames_decoded += 1;
                    out.push(DecodedBatch {
                        timestamp: now,
                        sequence: self.sequence,
                        samples,
                    });
                }
            }
        }
        out
    }

    fn try_extract_one(&self) -> Step {
        let buf = &self.buf;

        if buf.len() >= TAGGED_MARKER.len() {
            if &buf[0..TAGGED_MARKER.len()] == TAGGED_MARKER {
                return self.try_tagged(buf);
            }
        } else if is_prefix_of(buf, TAGGED_MARKER) {
            return Step::NeedMoreData;
        }

        if buf.len() < 4 {
            return Step::NeedMoreData;
        }

        let total_len = read_u32_be(buf, 0) as usize;
        if (LEGACY_MIN_TOTAL_LEN..=LEGACY_MAX_TOTAL_LEN).contains(&total_len) {
            let full_len = 4 + total_len;
            if buf.len() < full_len {
                return Step::NeedMoreData;
            }
            return self.try_legacy(buf, total_len);
        }

        Step::Resync
    }

    fn try_tagged(&self, buf: &[u8]) -> Step {
        if buf.len() < TAGGED_FRAME_LEN {
            return Step::NeedMoreData;
        }
        let ok = buf[TAGGED_SEPARATOR_OFFSET] == 0x00
            && buf[TAGGED_SEPARATOR_OFFSET + 1] == 0x0D
            && &buf[TAGGED_MARKER2_OFFSET..TAGGED_MARKER2_OFFSET + TAGGED_MARKER.len()]
                == TAGGED_MARKER
            && read_u32_be(buf, TAGGED_COUNT_OFFSET) == bench_registry::CHANNEL_COUNT as u32;
        if !ok {
            return Step::Resync;
        }

        let registry = ChannelRegistry::global();
        let mut samples = Vec::with_capacity(bench_registry::CHANNEL_COUNT);
        for position in 0..bench_registry::CHANNEL_COUNT {
            let offset = TAGGED_PAYLOAD_OFFSET + position * 8;
            let raw = read_f64_be(buf, offset);
            let Some(channel_index) = registry.position_to_index(position) else {
                continue;
            };
            samples.push(DecodedSample {
                channel_index,
                value: SampleValue::from_raw(raw),
            });
        }
        Step::Frame {
            consumed: TAGGED_FRAME_LEN,
            samples,
        }
    }

    fn try_legacy(&self, buf: &[u8], total_len: usize) -> Step {
        let n = read_u32_be(buf, 4 + LEGACY_HEADER_LEN) as usize;
        if n > LEGACY_MAX_N {
            return Step::Resync;
        }
        let expected_total = LEGACY_HEADER_LEN + 4 + 8 * n + 4;
        if total_len != expected_total {
            return Step::Resync;
        }
        let payload_offset = 4 + LEGACY_HEADER_LEN + 4;
        let trailer_offset = payload_offset + 8 * n;
        let trailer = read_u32_be(buf, trailer_offset) as usize;
        if trailer != total_len {
            return Step::Resync;
        }

        let mut samples = Vec::with_capacity(n);
        for position in 0..n {
            let offset = payload_offset + position * 8;
            let raw = read_f64_be(buf, offset);
            samples.push(DecodedSample {
                channel_index: position as u16,
                value: SampleValue::from_raw(raw),
            });
        }
        Step::Frame {
            consumed: 4 + total_len,
            samples,
        }
    }
}

enum Step {
    NeedMoreData,
    Resync,
    Frame {
        consumed: usize,
        samples: Vec<DecodedSample>,
    },
}

fn is_prefix_of(buf: &[u8], marker: &[u8]) -> bool {
    buf.len() < marker.len() && buf == &marker[..buf.len()]
}

fn read_u32_be(buf: &[u8], offset: usize) -> u32 {
    let mut cursor = Cursor::new(&buf[offset..offset + 4]);
    cursor.read_u32::<BigEndian>().expect("bounds checked by caller")
}

fn read_f64_be(buf: &[u8], offset: usize) -> f64 {
    let mut cursor = Cursor::new(&buf[offset..offset + 8]);
    cursor.read_f64::<BigEndian>().expect("bounds checked by caller")
}

/// Encodes a tagged frame for tests/tools, mirroring what the real
/// transmitter would send, given 134 values in registry-index order
/// indexed by protocol position.
pub fn encode_tagged_frame(values_by_position: &[f64; bench_registry::CHANNEL_COUNT]) -> Vec<u8> {
    use byteorder::WriteBytesExt;
    let mut out = Vec::with_capacity(TAGGED_FRAME_LEN);
    out.extend_from_slice(TAGGED_MARKER);
    out.extend_from_slice(&[0u8; 24]);
    out.push(0x00);
    out.push(0x0D);
    out.extend_from_slice(TAGGED_MARKER);
    out.write_u32::<BigEndian>(0).unwrap();
    out.write_u32::<BigEndian>(bench_registry::CHANNEL_COUNT as u32).unwrap();
    for v in values_by_position {
        out.write_f64::<BigEndian>(*v).unwrap();
    }
    out
}

/// Encodes a legacy test-only frame from up to 256 values.
pub fn encode_legacy_frame(values: &[f64]) -> Vec<u8> {
    use byteorder::WriteBytesExt;
    assert!(values.len() <= LEGACY_MAX_N);
    let n = values.len();
    let total_len = LEGACY_HEADER_LEN + 4 + 8 * n + 4;
    let mut out = Vec::with_capacity(4 + total_len);
    out.write_u32::<BigEndian>(total_len as u32).unwrap();
    out.extend_from_slice(&[0u8; LEGACY_HEADER_LEN]);
    out.write_u32::<BigEndian>(n as u32).unwrap();
    for v in values {
        out.write_f64::<BigEndian>(*v).unwrap();
    }
    out.write_u32::<BigEndian>(total_len as u32).unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn empty_feed_produces_no_samples_and_no_state_change() {
        let mut dec = ProtocolDecoder::new();
        let out = dec.feed(&[], now());
        assert!(out.is_empty());
        assert_eq!(dec.buffered_len(), 0);
    }

    #[test]
    fn happy_tagged_frame_maps_positions_through_registry() {
        let mut values = [0.0f64; bench_registry::CHANNEL_COUNT];
        for (p, v) in values.iter_mut().enumerate() {
            *v = p as f64;
        }
        let frame = encode_tagged_frame(&values);
        let mut dec = ProtocolDecoder::new();
        let batches = dec.feed(&frame, now());
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.samples.len(), bench_registry::CHANNEL_COUNT);

        let registry = ChannelRegistry::global();
        for (p, v) in values.iter().enumerate() {
            let idx = registry.position_to_index(p).unwrap();
            let sample = batch
                .samples
                .iter()
                .find(|s| s.channel_index == idx)
                .unwrap();
            assert_eq!(sample.value, SampleValue::Valid(*v));
        }
    }

    #[test]
    fn no_data_sentinel_is_distinguished() {
        let mut values = [1.0f64; bench_registry::CHANNEL_COUNT];
        values[0] = -99.0;
        values[1] = -98.99;
        let frame = encode_tagged_frame(&values);
        let mut dec = ProtocolDecoder::new();
        let batches = dec.feed(&frame, now());
        let registry = ChannelRegistry::global();
        let idx0 = registry.position_to_index(0).unwrap();
        let idx1 = registry.position_to_index(1).unwrap();
        let s0 = batches[0].samples.iter().find(|s| s.channel_index == idx0).unwrap();
        let s1 = batches[0].samples.iter().find(|s| s.channel_index == idx1).unwrap();
        assert_eq!(s0.value, SampleValue::NoData);
        assert_eq!(s1.value, SampleValue::Valid(-98.99));
    }

    #[test]
    fn marker_split_across_two_feeds_still_decodes() {
        let values = [2.0f64; bench_registry::CHANNEL_COUNT];
        let frame = encode_tagged_frame(&values);
        let (first, second) = frame.split_at(20);
        let mut dec = ProtocolDecoder::new();
        let out1 = dec.feed(first, now());
        assert!(out1.is_empty());
        let out2 = dec.feed(second, now());
        assert_eq!(out2.len(), 1);
    }

    #[test]
    fn legacy_frame_with_zero_samples_decodes_to_empty() {
        let frame = encode_legacy_frame(&[]);
        assert_eq!(frame.len(), 32);
        let mut dec = ProtocolDecoder::new();
        let out = dec.feed(&frame, now());
        assert_eq!(out.len(), 1);
        assert!(out[0].samples.is_empty());
    }

    #[test]
    fn legacy_frame_roundtrips_values_by_position() {
        let values = vec![1.5, -2.5, 3.25];
        let frame = encode_legacy_frame(&values);
        let mut dec = ProtocolDecoder::new();
        let out = dec.feed(&frame, now());
        assert_eq!(out.len(), 1);
        for (i, v) in values.iter().enumerate() {
            assert_eq!(out[0].samples[i].channel_index, i as u16);
            assert_eq!(out[0].samples[i].value, SampleValue::Valid(*v));
        }
    }

    #[test]
    fn garbage_prefix_is_discarded_before_tagged_marker() {
        let values = [3.0f64; bench_registry::CHANNEL_COUNT];
        let frame = encode_tagged_frame(&values);
        let mut input = vec![0xFFu8, 0x01, 0x02, 0x03, 0x04, 0x05];
        input.extend_from_slice(&frame);
        let mut dec = ProtocolDecoder::new();
        let out = dec.feed(&input, now());
        assert_eq!(out.len(), 1);
        assert!(dec.stats().gap_count > 0);
    }

    #[test]
    fn malformed_tagged_count_field_resyncs_without_aborting() {
        let values = [4.0f64; bench_registry::CHANNEL_COUNT];
        let mut frame = encode_tagged_frame(&values);
        // Corrupt the count field so validation fails.
        frame[TAGGED_COUNT_OFFSET + 3] = 0xFF;
        let mut dec = ProtocolDecoder::new();
        let out = dec.feed(&frame, now());
        assert!(out.is_empty());
        assert!(dec.stats().gap_count > 0);
    }

    #[test]
    fn buffer_never_exceeds_capacity_and_shrinks_on_overflow() {
        let mut dec = ProtocolDecoder::new();
        let junk = vec![0xAAu8; BUFFER_CAPACITY + 100];
        let out = dec.feed(&junk, now());
        assert!(out.is_empty());
        assert!(dec.buffered_len() <= RESYNC_RETAIN);
        assert!(dec.stats().buffer_overflow_count >= 1);
    }

    proptest::proptest! {
        #[test]
        fn decoder_never_panics_on_arbitrary_bytes(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..2000)) {
            let mut dec = ProtocolDecoder::new();
            let _ = dec.feed(&bytes, now());
        }
    }
}
