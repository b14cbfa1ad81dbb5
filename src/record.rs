// Wire-level record types shared by the decoder, transport and dispatch
// layers.

use bytes::Bytes;

/// Number of A2D channels carried by every data record.
pub const NUM_CHANNELS: usize = 8;

/// Common two-byte prefix of every binary frame sentinel.
pub const FRAME_PREFIX: [u8; 2] = [0xB4, 0xFA];

/// Sentinel length in bytes; frames are `START(4) . payload . END(4)`.
pub const SENTINEL_SIZE: usize = 4;

// Little-endian u32 view of the on-wire sentinel bytes.
pub const DATA_FRAME_START: u32 = 0xEDD1_FAB4;
pub const DATA_FRAME_END: u32 = 0xEDD2_FAB4;
pub const BLOCK_FRAME_START: u32 = 0xEDB1_FAB4;
pub const BLOCK_FRAME_END: u32 = 0xEDB2_FAB4;
pub const TELEMETRY_FRAME_START: u32 = 0xED71_FAB4;
pub const TELEMETRY_FRAME_END: u32 = 0xED72_FAB4;

/// `state` value a producer writes before it has committed a real state.
/// Records carrying it are suppressed before reaching the consumer.
pub const STATE_UNSET: u32 = 0x8000_0000;

/// Wire size of one data record body.
pub const DATA_WIRE_SIZE: usize = 64;
/// Wire size of one block item (a data record body without the shared
/// `state` field).
pub const ITEM_WIRE_SIZE: usize = 60;
/// Wire size of the block header: `state u32 . timestamp f64 . count u32 .
/// num_events u32`.
pub const BLOCK_HEADER_SIZE: usize = 20;
/// Wire size of one event item: `kind u8 . state_time f64`.
pub const EVENT_WIRE_SIZE: usize = 9;
/// Wire size of the telemetry body.
pub const TELEMETRY_WIRE_SIZE: usize = 16;

/// Upper bound on `count` in a block header.
pub const MAX_BLOCK_ITEMS: u32 = 164;
/// Upper bound on `num_events` in a block header.
pub const MAX_BLOCK_EVENTS: u32 = 512;
/// Maximum bytes copied into a single text record, terminator included.
pub const MAX_TEXT_SIZE: usize = 4096;

/// A timestamped slice of raw bytes as read from the port. Created once per
/// successful read and consumed immediately by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    /// Milliseconds since the transport opened (monotonic clock).
    pub timestamp_ms: u64,
    pub bytes: Bytes,
}

impl RawChunk {
    pub fn new(timestamp_ms: u64, bytes: impl Into<Bytes>) -> Self {
        Self { timestamp_ms, bytes: bytes.into() }
    }

    /// A byte-less continuation chunk used to drain further records already
    /// buffered in the decoder.
    pub fn empty(timestamp_ms: u64) -> Self {
        Self { timestamp_ms, bytes: Bytes::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One decoded data sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DataRecord {
    pub state: u32,
    pub timestamp: f64,
    pub state_time: f64,
    pub hw_state: u64,
    pub sensor_state: u32,
    pub channels: [u32; NUM_CHANNELS],
}

/// One decoded event timeline entry. The on-wire `kind` is a single byte,
/// widened here for the consumer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventItem {
    pub kind: u32,
    pub state_time: f64,
}

/// A decoded sample block: shared header plus item and event timelines.
/// Every item inherits the block's `state`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlockRecord {
    pub state: u32,
    pub timestamp: f64,
    pub items: Vec<DataRecord>,
    pub events: Vec<EventItem>,
}

/// One decoded point-telemetry reading. `key` is the little-endian reread
/// of the four bytes covering `group . subgroup . id`, used for map
/// indexing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TelemetryRecord {
    pub timestamp: f64,
    pub group: u8,
    pub subgroup: u8,
    pub id: u16,
    pub value: f32,
    pub key: u32,
}

/// A newline-terminated diagnostic or handshake line. `text` excludes the
/// terminator; the timestamp is stamped from the carrying chunk.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextRecord {
    pub timestamp_ms: u64,
    pub text: String,
}

impl TextRecord {
    /// Handshake traffic is any line beginning with `<` longer than one
    /// byte.
    pub fn is_handshake(&self) -> bool {
        self.text.len() > 1 && self.text.starts_with('<')
    }
}

/// The record kinds the decoder can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum RecordKind {
    Unknown,
    Data,
    Block,
    Telemetry,
    Text,
}

/// One record extracted from the byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedRecord {
    Data(DataRecord),
    Block(BlockRecord),
    Telemetry(TelemetryRecord),
    Text(TextRecord),
}

impl DecodedRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            DecodedRecord::Data(_) => RecordKind::Data,
            DecodedRecord::Block(_) => RecordKind::Block,
            DecodedRecord::Telemetry(_) => RecordKind::Telemetry,
            DecodedRecord::Text(_) => RecordKind::Text,
        }
    }
}

/// Total on-wire size of a data frame.
pub const fn data_frame_size() -> usize {
    SENTINEL_SIZE + DATA_WIRE_SIZE + SENTINEL_SIZE
}

/// Total on-wire size of a block frame carrying `count` items and
/// `num_events` events.
pub const fn block_frame_size(count: u32, num_events: u32) -> usize {
    SENTINEL_SIZE
        + BLOCK_HEADER_SIZE
        + count as usize * ITEM_WIRE_SIZE
        + num_events as usize * EVENT_WIRE_SIZE
        + SENTINEL_SIZE
}

/// Total on-wire size of a telemetry frame.
pub const fn telemetry_frame_size() -> usize {
    SENTINEL_SIZE + TELEMETRY_WIRE_SIZE + SENTINEL_SIZE
}
