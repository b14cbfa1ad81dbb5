// Byte queue holding unparsed input between reads. Confined to the reader
// thread; the decoder is not reentrant.

use bytes::{Buf, BytesMut};

use crate::record::FRAME_PREFIX;

/// Append-only-with-prefix-erase byte queue. The head is always either a
/// candidate frame start, printable text, or stale junk awaiting resync.
#[derive(Debug, Default)]
pub(crate) struct Accumulator {
    buf: BytesMut,
}

impl Accumulator {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(8192) }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes `n` bytes from the head.
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Offset of the first occurrence of `byte`, if any.
    pub fn find_byte(&self, byte: u8) -> Option<usize> {
        self.buf.iter().position(|&b| b == byte)
    }

    /// Offset of the first frame prefix at or after `from`.
    pub fn find_prefix_from(&self, from: usize) -> Option<usize> {
        if self.buf.len() < from + FRAME_PREFIX.len() {
            return None;
        }
        self.buf[from..]
            .windows(FRAME_PREFIX.len())
            .position(|w| w == FRAME_PREFIX)
            .map(|p| p + from)
    }

    /// Drops everything except the trailing `keep` bytes.
    pub fn keep_tail(&mut self, keep: usize) {
        if self.buf.len() > keep {
            self.buf.advance(self.buf.len() - keep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_removes_head() {
        let mut acc = Accumulator::new();
        acc.extend(&[1, 2, 3, 4]);
        acc.consume(2);
        assert_eq!(acc.as_slice(), &[3, 4]);
    }

    #[test]
    fn prefix_search_skips_offset_zero() {
        let mut acc = Accumulator::new();
        acc.extend(&[0xB4, 0xFA, 0x00, 0xB4, 0xFA]);
        assert_eq!(acc.find_prefix_from(1), Some(3));
        assert_eq!(acc.find_prefix_from(0), Some(0));
    }

    #[test]
    fn prefix_search_misses_lone_byte() {
        let mut acc = Accumulator::new();
        acc.extend(&[0x00, 0xB4]);
        assert_eq!(acc.find_prefix_from(1), None);
    }

    #[test]
    fn keep_tail_truncates_front() {
        let mut acc = Accumulator::new();
        acc.extend(&[1, 2, 3, 4, 5]);
        acc.keep_tail(1);
        assert_eq!(acc.as_slice(), &[5]);
        acc.keep_tail(4);
        assert_eq!(acc.as_slice(), &[5]);
    }
}
