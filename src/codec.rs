/// Binary record format for the persisted book log
///
/// Every record starts with a 1-byte record type tag. All integers and floats
/// are little-endian.
///
///   Sync:  tag | sequence u64 | bid_count u64 | bids | ask_count u64 | asks
///   Diff:  tag | sequence u64 | first u64 | last u64 | bid_count u64 | bids | ask_count u64 | asks
///   Trade: tag | seq u64 (always 0) | side u8 | price f64 | size f64
///
/// A level is `price f64 | size f64`. The Diff `sequence` field always equals
/// `first`; both are kept for format compatibility.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::book::{BookLevels, OrderBook, Trade, TradeSide};
use crate::price_level::PriceLevel;

pub const TAG_SIZE: usize = 1;
pub const LEVEL_SIZE: usize = 16;
pub const SYNC_HEADER_SIZE: usize = TAG_SIZE + 8;
pub const DIFF_HEADER_SIZE: usize = TAG_SIZE + 8 * 3;
pub const TRADE_SIZE: usize = TAG_SIZE + 8 + 1 + 8 + 8;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Sync = 1,
    Diff = 2,
    Trade = 3,
}

impl RecordType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordType::Sync),
            2 => Some(RecordType::Diff),
            3 => Some(RecordType::Trade),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("invalid record type: {0}")]
    InvalidRecordType(u8),

    #[error("invalid trade side: {0}")]
    InvalidSide(u8),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Sync {
        sequence: u64,
        levels: BookLevels,
    },
    Diff {
        sequence: u64,
        first: u64,
        last: u64,
        levels: BookLevels,
    },
    Trade {
        seq: u64,
        side: TradeSide,
        price: f64,
        size: f64,
    },
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Record::Sync { .. } => RecordType::Sync,
            Record::Diff { .. } => RecordType::Diff,
            Record::Trade { .. } => RecordType::Trade,
        }
    }
}

// Fixed-size writer over a buffer sized up front
struct RecordWriter {
    buf: Vec<u8>,
    pos: usize,
}

impl RecordWriter {
    fn new(record_type: RecordType, len: usize) -> Self {
        let mut buf = vec![0u8; len];
        buf[0] = record_type as u8;
        RecordWriter { buf, pos: TAG_SIZE }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    fn put_u64(&mut self, v: u64) {
        LittleEndian::write_u64(&mut self.buf[self.pos..self.pos + 8], v);
        self.pos += 8;
    }

    fn put_f64(&mut self, v: f64) {
        LittleEndian::write_f64(&mut self.buf[self.pos..self.pos + 8], v);
        self.pos += 8;
    }

    fn put_levels(&mut self, levels: &[PriceLevel]) {
        self.put_u64(levels.len() as u64);
        for level in levels {
            self.put_f64(level.price);
            self.put_f64(level.size);
        }
    }

    fn finish(self) -> Vec<u8> {
        debug_assert_eq!(self.pos, self.buf.len());
        self.buf
    }
}

fn levels_size(levels: &BookLevels) -> usize {
    8 + levels.bids.len() * LEVEL_SIZE + 8 + levels.asks.len() * LEVEL_SIZE
}

/// Encode a Sync record from explicit sequence and levels
pub fn encode_sync(sequence: u64, levels: &BookLevels) -> Vec<u8> {
    let mut w = RecordWriter::new(RecordType::Sync, SYNC_HEADER_SIZE + levels_size(levels));
    w.put_u64(sequence);
    w.put_levels(&levels.bids);
    w.put_levels(&levels.asks);
    w.finish()
}

/// Encode the full tombstone-free state of a book
pub fn encode_snapshot(book: &OrderBook) -> Vec<u8> {
    encode_sync(book.sequence(), &book.snapshot_view())
}

pub fn encode_diff(first: u64, last: u64, diff: &BookLevels) -> Vec<u8> {
    let mut w = RecordWriter::new(RecordType::Diff, DIFF_HEADER_SIZE + levels_size(diff));
    w.put_u64(first); // sequence
    w.put_u64(first);
    w.put_u64(last);
    w.put_levels(&diff.bids);
    w.put_levels(&diff.asks);
    w.finish()
}

pub fn encode_trade(trade: &Trade) -> Vec<u8> {
    let mut w = RecordWriter::new(RecordType::Trade, TRADE_SIZE);
    w.put_u64(0);
    w.put_u8(trade.side as u8);
    w.put_f64(trade.price);
    w.put_f64(trade.size);
    w.finish()
}

struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn need(&self, n: usize) -> DecodeResult<()> {
        let have = self.buf.len() - self.pos;
        if have < n {
            return Err(DecodeError::BufferTooSmall {
                need: self.pos.saturating_add(n),
                have: self.buf.len(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> DecodeResult<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u64(&mut self) -> DecodeResult<u64> {
        self.need(8)?;
        let v = LittleEndian::read_u64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    fn f64(&mut self) -> DecodeResult<f64> {
        self.need(8)?;
        let v = LittleEndian::read_f64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    fn levels(&mut self) -> DecodeResult<Vec<PriceLevel>> {
        let count = self.u64()?;
        // reject counts the remaining buffer cannot hold before allocating
        let bytes = usize::try_from(count)
            .ok()
            .and_then(|c| c.checked_mul(LEVEL_SIZE))
            .unwrap_or(usize::MAX);
        self.need(bytes)?;

        let mut levels = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let price = self.f64()?;
            let size = self.f64()?;
            levels.push(PriceLevel::new(price, size));
        }
        Ok(levels)
    }

    fn book_levels(&mut self) -> DecodeResult<BookLevels> {
        let bids = self.levels()?;
        let asks = self.levels()?;
        Ok(BookLevels { bids, asks })
    }
}

/// Decode a single record from the start of `buffer`.
/// Returns the record and the number of bytes consumed.
pub fn decode_record(buffer: &[u8]) -> DecodeResult<(Record, usize)> {
    let mut r = RecordReader { buf: buffer, pos: 0 };
    let tag = r.u8()?;
    let record_type = RecordType::from_u8(tag).ok_or(DecodeError::InvalidRecordType(tag))?;

    let record = match record_type {
        RecordType::Sync => {
            let sequence = r.u64()?;
            let levels = r.book_levels()?;
            Record::Sync { sequence, levels }
        }
        RecordType::Diff => {
            let sequence = r.u64()?;
            let first = r.u64()?;
            let last = r.u64()?;
            let levels = r.book_levels()?;
            Record::Diff {
                sequence,
                first,
                last,
                levels,
            }
        }
        RecordType::Trade => {
            let seq = r.u64()?;
            let raw_side = r.u8()?;
            let side = TradeSide::from_u8(raw_side).ok_or(DecodeError::InvalidSide(raw_side))?;
            let price = r.f64()?;
            let size = r.f64()?;
            Record::Trade {
                seq,
                side,
                price,
                size,
            }
        }
    };

    Ok((record, r.pos))
}

/// Decode a stream of concatenated records
/// Calls callback for each record; stops on error or if callback returns false
pub fn decode_stream<F>(buffer: &[u8], mut callback: F) -> DecodeResult<usize>
where
    F: FnMut(&Record) -> bool,
{
    let mut offset = 0;
    let mut count = 0;

    while offset < buffer.len() {
        let (record, consumed) = decode_record(&buffer[offset..])?;
        if !callback(&record) {
            break;
        }
        offset += consumed;
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_level::Side;
    use chrono::Utc;

    fn sample_book() -> OrderBook {
        let mut book = OrderBook::new("BTC-USDT");
        book.set_sequence(77);
        book.apply_level_update(Side::Bid, 100.0, 5.0);
        book.apply_level_update(Side::Bid, 99.5, 1.0);
        book.apply_level_update(Side::Ask, 101.0, 3.0);
        book
    }

    #[test]
    fn test_record_type_conversion() {
        assert_eq!(RecordType::from_u8(1), Some(RecordType::Sync));
        assert_eq!(RecordType::from_u8(3), Some(RecordType::Trade));
        assert_eq!(RecordType::from_u8(0), None);
    }

    #[test]
    fn test_sync_layout() {
        let bytes = encode_snapshot(&sample_book());
        assert_eq!(bytes.len(), SYNC_HEADER_SIZE + 8 + 2 * LEVEL_SIZE + 8 + LEVEL_SIZE);
        assert_eq!(bytes[0], RecordType::Sync as u8);
        assert_eq!(LittleEndian::read_u64(&bytes[1..9]), 77);
        assert_eq!(LittleEndian::read_u64(&bytes[9..17]), 2);
        assert_eq!(LittleEndian::read_f64(&bytes[17..25]), 100.0);
        assert_eq!(LittleEndian::read_f64(&bytes[25..33]), 5.0);
    }

    #[test]
    fn test_diff_duplicates_first() {
        let diff = BookLevels {
            bids: vec![PriceLevel::new(100.0, 5.0)],
            asks: vec![],
        };
        let bytes = encode_diff(10, 20, &diff);
        assert_eq!(bytes[0], RecordType::Diff as u8);
        assert_eq!(LittleEndian::read_u64(&bytes[1..9]), 10);
        assert_eq!(LittleEndian::read_u64(&bytes[9..17]), 10);
        assert_eq!(LittleEndian::read_u64(&bytes[17..25]), 20);
        assert_eq!(bytes.len(), DIFF_HEADER_SIZE + 8 + LEVEL_SIZE + 8);
    }

    #[test]
    fn test_trade_layout() {
        let trade = Trade {
            time: Utc::now(),
            side: TradeSide::Sell,
            price: 101.5,
            size: 0.25,
        };
        let bytes = encode_trade(&trade);
        assert_eq!(bytes.len(), TRADE_SIZE);
        assert_eq!(bytes[0], RecordType::Trade as u8);
        assert_eq!(LittleEndian::read_u64(&bytes[1..9]), 0);
        assert_eq!(bytes[9], TradeSide::Sell as u8);
        assert_eq!(LittleEndian::read_f64(&bytes[10..18]), 101.5);
        assert_eq!(LittleEndian::read_f64(&bytes[18..26]), 0.25);
    }

    #[test]
    fn test_snapshot_decodes_to_view() {
        let book = sample_book();
        let bytes = encode_snapshot(&book);
        let (record, consumed) = decode_record(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(
            record,
            Record::Sync {
                sequence: 77,
                levels: book.snapshot_view()
            }
        );
    }

    #[test]
    fn test_buffer_too_small() {
        let bytes = encode_snapshot(&sample_book());
        let result = decode_record(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(DecodeError::BufferTooSmall { .. })));
        assert!(matches!(decode_record(&[]), Err(DecodeError::BufferTooSmall { .. })));
    }

    #[test]
    fn test_invalid_record_type() {
        let result = decode_record(&[99, 0, 0, 0]);
        assert!(matches!(result, Err(DecodeError::InvalidRecordType(99))));
    }

    #[test]
    fn test_invalid_side() {
        let mut bytes = encode_trade(&Trade {
            time: Utc::now(),
            side: TradeSide::Buy,
            price: 1.0,
            size: 1.0,
        });
        bytes[9] = 9;
        assert!(matches!(decode_record(&bytes), Err(DecodeError::InvalidSide(9))));
    }

    #[test]
    fn test_huge_level_count_rejected() {
        let mut bytes = vec![RecordType::Sync as u8];
        bytes.extend_from_slice(&[0u8; 8]);
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(decode_record(&bytes), Err(DecodeError::BufferTooSmall { .. })));
    }
}
