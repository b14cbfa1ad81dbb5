//! Resynchronising frame decoder.
//!
//! Consumes the raw byte stream one chunk at a time and yields tagged
//! records across the four frame formats, tolerating corruption, partial
//! reads and interleaved ASCII. Confined to the transport reader thread.

use bytes::Buf;
use tracing::debug;

use crate::record::{
    BLOCK_FRAME_END, BLOCK_FRAME_START, BLOCK_HEADER_SIZE, BlockRecord, DATA_FRAME_END,
    DATA_FRAME_START, DATA_WIRE_SIZE, DataRecord, DecodedRecord, EVENT_WIRE_SIZE, EventItem,
    FRAME_PREFIX, ITEM_WIRE_SIZE, MAX_BLOCK_EVENTS, MAX_BLOCK_ITEMS, MAX_TEXT_SIZE, NUM_CHANNELS,
    RawChunk, SENTINEL_SIZE, TELEMETRY_FRAME_END, TELEMETRY_FRAME_START, TELEMETRY_WIRE_SIZE,
    TelemetryRecord, TextRecord, block_frame_size, data_frame_size, telemetry_frame_size,
};

mod accumulator;
use accumulator::Accumulator;

/// Invalid-header observations tolerated before one leading byte is
/// dropped. The resync atom is a single byte, not a whole header width.
const BAD_HEADER_LIMIT: u32 = 3;
/// Accumulator size past which the buffer is truncated to a 1-byte tail
/// (the longest possible partial frame prefix) when no prefix is in sight.
const MAX_ACCUMULATED: usize = 4096;

/// Outcome of the single-attempt header inspection at offset 0.
#[derive(Debug)]
enum QuickCheck {
    TooShort,
    NoHeader,
    IncompleteHeader,
    IncompletePacket,
    InvalidHeader,
    InvalidFooter,
    Valid { record: DecodedRecord, used: usize },
}

/// Streaming decoder. `process` appends a chunk and extracts at most one
/// record; poll again with [`RawChunk::empty`] to drain the rest.
#[derive(Debug)]
pub struct Decoder {
    acc: Accumulator,
    bad_headers: u32,
    /// Highest block-item timestamp seen over the decoder lifetime; items
    /// may only move forward.
    last_item_timestamp: f64,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            acc: Accumulator::new(),
            bad_headers: 0,
            last_item_timestamp: f64::NEG_INFINITY,
        }
    }

    /// Empties the accumulator and clears the bad-header counter.
    pub fn reset(&mut self) {
        self.acc.clear();
        self.bad_headers = 0;
    }

    /// Appends the chunk's bytes and attempts to extract one complete
    /// record from the head. `None` means more input is needed.
    pub fn process(&mut self, chunk: &RawChunk) -> Option<DecodedRecord> {
        self.acc.extend(&chunk.bytes);
        self.extract(chunk.timestamp_ms)
    }

    fn extract(&mut self, timestamp_ms: u64) -> Option<DecodedRecord> {
        loop {
            if self.acc.is_empty() {
                return None;
            }

            let check = quick_check(self.acc.as_slice());
            match check {
                QuickCheck::Valid { mut record, used } => {
                    self.acc.consume(used);
                    self.bad_headers = 0;
                    if let DecodedRecord::Block(block) = &mut record {
                        self.clamp_item_timestamps(block);
                    }
                    return Some(record);
                }
                QuickCheck::IncompleteHeader | QuickCheck::IncompletePacket => return None,
                _ => {}
            }

            // A stray END sentinel is the tail of an already-consumed frame.
            if starts_with_end_sentinel(self.acc.as_slice()) {
                self.acc.consume(SENTINEL_SIZE);
                return None;
            }

            if let Some(newline) = self.acc.find_byte(b'\n') {
                let record = self.take_text(newline, timestamp_ms);
                self.bad_headers = 0;
                return Some(DecodedRecord::Text(record));
            }

            if matches!(check, QuickCheck::InvalidHeader | QuickCheck::InvalidFooter) {
                self.bad_headers += 1;
                if self.bad_headers > BAD_HEADER_LIMIT {
                    self.acc.consume(1);
                    self.bad_headers = 0;
                    debug!("bad header burst; dropped one byte to resync");
                    if self.acc.is_empty() {
                        return None;
                    }
                }
            }

            match self.acc.find_prefix_from(1) {
                Some(pos) => {
                    // Discard leading junk and retry the quick-check at the
                    // candidate start.
                    self.acc.consume(pos);
                }
                None => {
                    if self.acc.len() > MAX_ACCUMULATED {
                        debug!(len = self.acc.len(), "accumulator bloat; keeping 1-byte tail");
                        self.acc.keep_tail(1);
                    }
                    return None;
                }
            }
        }
    }

    fn clamp_item_timestamps(&mut self, block: &mut BlockRecord) {
        for item in &mut block.items {
            if item.timestamp < self.last_item_timestamp {
                item.timestamp = self.last_item_timestamp;
            } else {
                self.last_item_timestamp = item.timestamp;
            }
        }
    }

    /// Consumes a newline-terminated line; the text excludes the
    /// terminator and overlong lines are truncated to [`MAX_TEXT_SIZE`].
    fn take_text(&mut self, newline: usize, timestamp_ms: u64) -> TextRecord {
        let consumed = newline + 1;
        let copied = consumed.min(MAX_TEXT_SIZE - 1);
        let slice = &self.acc.as_slice()[..copied];
        let line = slice.strip_suffix(b"\n").unwrap_or(slice);
        let text = String::from_utf8_lossy(line).into_owned();
        self.acc.consume(consumed);
        TextRecord { timestamp_ms, text }
    }
}

fn read_u32_at(buf: &[u8], offset: usize) -> u32 {
    let mut field = &buf[offset..offset + 4];
    field.get_u32_le()
}

fn starts_with_end_sentinel(buf: &[u8]) -> bool {
    buf.len() >= SENTINEL_SIZE
        && matches!(
            read_u32_at(buf, 0),
            DATA_FRAME_END | BLOCK_FRAME_END | TELEMETRY_FRAME_END
        )
}

fn quick_check(buf: &[u8]) -> QuickCheck {
    if buf.is_empty() {
        return QuickCheck::TooShort;
    }
    if buf[0] != FRAME_PREFIX[0] {
        return QuickCheck::NoHeader;
    }
    if buf.len() < FRAME_PREFIX.len() {
        return QuickCheck::IncompleteHeader;
    }
    if buf[1] != FRAME_PREFIX[1] {
        return QuickCheck::NoHeader;
    }
    if buf.len() < SENTINEL_SIZE {
        return QuickCheck::IncompleteHeader;
    }

    match read_u32_at(buf, 0) {
        DATA_FRAME_START => check_data(buf),
        BLOCK_FRAME_START => check_block(buf),
        TELEMETRY_FRAME_START => check_telemetry(buf),
        _ => QuickCheck::InvalidHeader,
    }
}

fn check_data(buf: &[u8]) -> QuickCheck {
    let need = data_frame_size();
    if buf.len() < need {
        return QuickCheck::IncompletePacket;
    }
    if read_u32_at(buf, need - SENTINEL_SIZE) != DATA_FRAME_END {
        return QuickCheck::InvalidFooter;
    }
    let record = parse_data_body(&buf[SENTINEL_SIZE..SENTINEL_SIZE + DATA_WIRE_SIZE]);
    QuickCheck::Valid { record: DecodedRecord::Data(record), used: need }
}

fn check_block(buf: &[u8]) -> QuickCheck {
    if buf.len() < SENTINEL_SIZE + BLOCK_HEADER_SIZE {
        return QuickCheck::IncompletePacket;
    }
    let count = read_u32_at(buf, SENTINEL_SIZE + 12);
    let num_events = read_u32_at(buf, SENTINEL_SIZE + 16);
    if count > MAX_BLOCK_ITEMS || num_events > MAX_BLOCK_EVENTS {
        return QuickCheck::InvalidHeader;
    }

    let need = block_frame_size(count, num_events);
    if buf.len() < need {
        return QuickCheck::IncompletePacket;
    }
    if read_u32_at(buf, need - SENTINEL_SIZE) != BLOCK_FRAME_END {
        return QuickCheck::InvalidFooter;
    }

    let mut header = &buf[SENTINEL_SIZE..];
    let state = header.get_u32_le();
    let timestamp = header.get_f64_le();

    let mut block = BlockRecord {
        state,
        timestamp,
        items: Vec::with_capacity(count as usize),
        events: Vec::with_capacity(num_events as usize),
    };
    let mut body = &buf[SENTINEL_SIZE + BLOCK_HEADER_SIZE..];
    for _ in 0..count {
        let mut item = parse_item_body(&body[..ITEM_WIRE_SIZE]);
        item.state = state;
        block.items.push(item);
        body.advance(ITEM_WIRE_SIZE);
    }
    for _ in 0..num_events {
        let kind = u32::from(body.get_u8());
        let state_time = body.get_f64_le();
        block.events.push(EventItem { kind, state_time });
    }

    QuickCheck::Valid { record: DecodedRecord::Block(block), used: need }
}

fn check_telemetry(buf: &[u8]) -> QuickCheck {
    let need = telemetry_frame_size();
    if buf.len() < need {
        return QuickCheck::IncompletePacket;
    }
    if read_u32_at(buf, need - SENTINEL_SIZE) != TELEMETRY_FRAME_END {
        return QuickCheck::InvalidFooter;
    }

    let body = &buf[SENTINEL_SIZE..SENTINEL_SIZE + TELEMETRY_WIRE_SIZE];
    let mut fields = body;
    let timestamp = fields.get_f64_le();
    let group = fields.get_u8();
    let subgroup = fields.get_u8();
    let id = fields.get_u16_le();
    let value = fields.get_f32_le();
    // The map key is the same group/subgroup/id bytes reread as one word.
    let key = read_u32_at(body, 8);

    let record = TelemetryRecord { timestamp, group, subgroup, id, value, key };
    QuickCheck::Valid { record: DecodedRecord::Telemetry(record), used: need }
}

fn parse_data_body(mut body: &[u8]) -> DataRecord {
    let state = body.get_u32_le();
    let mut record = parse_item_body(body);
    record.state = state;
    record
}

/// Parses a data record body without the leading `state` field.
fn parse_item_body(mut body: &[u8]) -> DataRecord {
    let timestamp = body.get_f64_le();
    let state_time = body.get_f64_le();
    let hw_state = body.get_u64_le();
    let sensor_state = body.get_u32_le();
    let mut channels = [0u32; NUM_CHANNELS];
    for channel in &mut channels {
        *channel = body.get_u32_le();
    }
    DataRecord { state: 0, timestamp, state_time, hw_state, sensor_state, channels }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::STATE_UNSET;

    fn put_u32(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn put_item_body(out: &mut Vec<u8>, item: &DataRecord) {
        out.extend_from_slice(&item.timestamp.to_le_bytes());
        out.extend_from_slice(&item.state_time.to_le_bytes());
        out.extend_from_slice(&item.hw_state.to_le_bytes());
        put_u32(out, item.sensor_state);
        for channel in item.channels {
            put_u32(out, channel);
        }
    }

    fn frame_data(record: &DataRecord) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, DATA_FRAME_START);
        put_u32(&mut out, record.state);
        put_item_body(&mut out, record);
        put_u32(&mut out, DATA_FRAME_END);
        out
    }

    fn frame_block(state: u32, timestamp: f64, items: &[DataRecord], events: &[(u8, f64)]) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, BLOCK_FRAME_START);
        put_u32(&mut out, state);
        out.extend_from_slice(&timestamp.to_le_bytes());
        put_u32(&mut out, items.len() as u32);
        put_u32(&mut out, events.len() as u32);
        for item in items {
            put_item_body(&mut out, item);
        }
        for (kind, state_time) in events {
            out.push(*kind);
            out.extend_from_slice(&state_time.to_le_bytes());
        }
        put_u32(&mut out, BLOCK_FRAME_END);
        out
    }

    fn frame_telemetry(timestamp: f64, group: u8, subgroup: u8, id: u16, value: f32) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, TELEMETRY_FRAME_START);
        out.extend_from_slice(&timestamp.to_le_bytes());
        out.push(group);
        out.push(subgroup);
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
        put_u32(&mut out, TELEMETRY_FRAME_END);
        out
    }

    fn sample_record() -> DataRecord {
        DataRecord {
            state: 3,
            timestamp: 1.5,
            state_time: 2.5,
            hw_state: 0x0102_0304_0506_0708,
            sensor_state: 0x1122_3344,
            channels: [1, 2, 3, 4, 5, 6, 7, 8],
        }
    }

    fn feed(decoder: &mut Decoder, bytes: &[u8]) -> Vec<DecodedRecord> {
        let mut records = Vec::new();
        let chunk = RawChunk::new(7, bytes.to_vec());
        if let Some(record) = decoder.process(&chunk) {
            records.push(record);
        }
        while let Some(record) = decoder.process(&RawChunk::empty(7)) {
            records.push(record);
        }
        records
    }

    #[test]
    fn data_round_trip_byte_by_byte() {
        let record = sample_record();
        let framed = frame_data(&record);
        let mut decoder = Decoder::new();
        let mut records = Vec::new();
        for (i, byte) in framed.iter().enumerate() {
            let chunk = RawChunk::new(i as u64, vec![*byte]);
            if let Some(r) = decoder.process(&chunk) {
                records.push(r);
            }
        }
        assert_eq!(records, vec![DecodedRecord::Data(record)]);
        assert!(decoder.process(&RawChunk::empty(0)).is_none());
    }

    #[test]
    fn block_round_trip() {
        let mut items = [sample_record(), sample_record()];
        items[0].state = 9;
        items[1].state = 9;
        items[1].timestamp = 2.0;
        let framed = frame_block(9, 4.5, &items, &[]);
        let mut decoder = Decoder::new();
        let records = feed(&mut decoder, &framed);
        assert_eq!(records.len(), 1);
        let DecodedRecord::Block(block) = &records[0] else {
            panic!("expected block, got {records:?}");
        };
        assert_eq!(block.state, 9);
        assert_eq!(block.timestamp, 4.5);
        assert_eq!(block.items, items.to_vec());
        assert!(block.events.is_empty());
    }

    #[test]
    fn telemetry_round_trip_and_key() {
        // The key is the little-endian concatenation of group|subgroup|id.
        let framed = frame_telemetry(3.5, 0x12, 0x34, 0x5678, 1.0);
        let mut decoder = Decoder::new();
        let records = feed(&mut decoder, &framed);
        let DecodedRecord::Telemetry(t) = &records[0] else {
            panic!("expected telemetry, got {records:?}");
        };
        assert_eq!(t.group, 0x12);
        assert_eq!(t.subgroup, 0x34);
        assert_eq!(t.id, 0x5678);
        assert_eq!(t.value, 1.0);
        assert_eq!(t.key, 0x5678_3412);
    }

    #[test]
    fn resync_past_leading_junk() {
        // Junk without the frame prefix is dropped and the frame parses;
        // nothing is left behind.
        let record = sample_record();
        let mut stream = vec![0x00, 0x00];
        stream.extend_from_slice(&frame_data(&record));
        let mut decoder = Decoder::new();
        let records = feed(&mut decoder, &stream);
        assert_eq!(records, vec![DecodedRecord::Data(record)]);
        assert!(decoder.process(&RawChunk::empty(0)).is_none());
    }

    #[test]
    fn text_then_frame_in_order() {
        let record = sample_record();
        let mut stream = b"hello\n".to_vec();
        stream.extend_from_slice(&frame_data(&record));
        let mut decoder = Decoder::new();
        let records = feed(&mut decoder, &stream);
        assert_eq!(records.len(), 2);
        let DecodedRecord::Text(text) = &records[0] else {
            panic!("expected text first, got {records:?}");
        };
        assert_eq!(text.text, "hello");
        assert_eq!(text.timestamp_ms, 7);
        assert_eq!(records[1], DecodedRecord::Data(record));
    }

    #[test]
    fn stray_end_sentinel_is_dropped() {
        let mut decoder = Decoder::new();
        let records = feed(&mut decoder, &DATA_FRAME_END.to_le_bytes());
        assert!(records.is_empty());
        // The four bytes were consumed: a following frame parses cleanly.
        let record = sample_record();
        let records = feed(&mut decoder, &frame_data(&record));
        assert_eq!(records, vec![DecodedRecord::Data(record)]);
    }

    #[test]
    fn block_item_timestamps_only_move_forward() {
        let mut decoder = Decoder::new();
        let mut first = sample_record();
        first.timestamp = 10.0;
        let mut second = sample_record();
        second.timestamp = 4.0; // regresses; must clamp to 10.0
        let records = feed(&mut decoder, &frame_block(1, 0.0, &[first], &[]));
        assert_eq!(records.len(), 1);
        let records = feed(&mut decoder, &frame_block(1, 0.0, &[second], &[]));
        let DecodedRecord::Block(block) = &records[0] else {
            panic!("expected block");
        };
        assert_eq!(block.items[0].timestamp, 10.0);
    }

    #[test]
    fn block_with_events_widens_kind() {
        // Three items, two events; the on-wire u8 kind widens to u32.
        let item = DataRecord { state: 5, ..sample_record() };
        let framed = frame_block(5, 1.0, &[item, item, item], &[(2, 0.25), (0xFE, 0.5)]);
        let mut decoder = Decoder::new();
        let records = feed(&mut decoder, &framed);
        let DecodedRecord::Block(block) = &records[0] else {
            panic!("expected block");
        };
        assert_eq!(block.items.len(), 3);
        assert_eq!(
            block.events,
            vec![
                EventItem { kind: 2, state_time: 0.25 },
                EventItem { kind: 0xFE, state_time: 0.5 }
            ]
        );
    }

    #[test]
    fn unset_state_block_still_decodes() {
        // Suppression happens in the dispatch bridge, not here.
        let item = DataRecord { state: STATE_UNSET, ..sample_record() };
        let framed = frame_block(STATE_UNSET, 1.0, &[item], &[]);
        let mut decoder = Decoder::new();
        let records = feed(&mut decoder, &framed);
        assert!(matches!(&records[0], DecodedRecord::Block(b) if b.state == STATE_UNSET));
    }

    #[test]
    fn oversized_block_count_resyncs() {
        let mut out = Vec::new();
        put_u32(&mut out, BLOCK_FRAME_START);
        put_u32(&mut out, 1);
        out.extend_from_slice(&1.0f64.to_le_bytes());
        put_u32(&mut out, MAX_BLOCK_ITEMS + 1);
        put_u32(&mut out, 0);
        let mut decoder = Decoder::new();
        assert!(feed(&mut decoder, &out).is_empty());
        // The poisoned header is eventually discarded and a valid frame
        // still gets through.
        let record = sample_record();
        for _ in 0..8 {
            let _ = decoder.process(&RawChunk::empty(0));
        }
        let records = feed(&mut decoder, &frame_data(&record));
        assert_eq!(records.last(), Some(&DecodedRecord::Data(record)));
    }

    #[test]
    fn bad_header_burst_drops_one_byte_per_threshold() {
        // An unknown sentinel with no newline and no second prefix sits
        // until the counter crosses the limit, then sheds a single byte.
        let mut decoder = Decoder::new();
        assert!(feed(&mut decoder, &[0xB4, 0xFA, 0xFF, 0xED]).is_empty());
        for _ in 0..6 {
            assert!(decoder.process(&RawChunk::empty(0)).is_none());
        }
        // Head is no longer the prefix, so a following frame is found by
        // the prefix rescan.
        let record = sample_record();
        let records = feed(&mut decoder, &frame_data(&record));
        assert_eq!(records, vec![DecodedRecord::Data(record)]);
    }

    #[test]
    fn accumulator_bloat_keeps_one_byte_tail() {
        let mut decoder = Decoder::new();
        assert!(feed(&mut decoder, &vec![0u8; 5000]).is_empty());
        let record = sample_record();
        let records = feed(&mut decoder, &frame_data(&record));
        assert_eq!(records, vec![DecodedRecord::Data(record)]);
    }

    #[test]
    fn overlong_text_is_truncated() {
        let mut line = vec![b'x'; MAX_TEXT_SIZE + 10];
        line.push(b'\n');
        let mut decoder = Decoder::new();
        let records = feed(&mut decoder, &line);
        let DecodedRecord::Text(text) = &records[0] else {
            panic!("expected text");
        };
        assert_eq!(text.text.len(), MAX_TEXT_SIZE - 1);
        // The whole line was consumed regardless of the copy cap.
        assert!(decoder.process(&RawChunk::empty(0)).is_none());
    }

    #[test]
    fn reset_discards_partial_input() {
        let record = sample_record();
        let framed = frame_data(&record);
        let mut decoder = Decoder::new();
        assert!(decoder.process(&RawChunk::new(0, framed[..10].to_vec())).is_none());
        decoder.reset();
        let records = feed(&mut decoder, &framed);
        assert_eq!(records, vec![DecodedRecord::Data(record)]);
    }
}
