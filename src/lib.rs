/// Book Recorder - Order Book Replica and Binary Log Writer
///
/// Keeps a local replica of exchange limit order books in sync from streaming
/// depth and trade feeds, and records it as a compact binary log of periodic
/// full snapshots, incremental diffs and trade prints. Features include:
/// - Range-continuity and monotonic-timestamp sequence gating
/// - Gap detection with snapshot-based resync
/// - Trade aggressor inference from top of book
/// - Snapshot/diff/trade record codec
/// - Per-instrument batched persistence

pub mod price_level;
pub mod book;
pub mod sync_gate;
pub mod classifier;
pub mod codec;
pub mod batch;
pub mod store;
pub mod event;
pub mod exchange;
pub mod feed;
pub mod config;
pub mod error;
pub mod stats;

pub use price_level::{PriceLevel, PriceTable, Side};
pub use book::{BookLevels, OrderBook, Trade, TradeSide};
pub use sync_gate::{SyncPolicy, Verdict};
pub use classifier::{classify_side, side_for};
pub use codec::{decode_record, decode_stream, encode_diff, encode_snapshot, encode_trade, DecodeError, Record, RecordType};
pub use batch::{BatchState, BatchWriter, Checkpoint};
pub use store::{FileStore, MemoryStore, RecordStore, StoredRecord};
pub use event::{BookSnapshot, ControlEvent, DepthUpdate, FeedMessage, ProductInfo, TradeEvent};
pub use exchange::{Exchange, StreamKeys};
pub use feed::{FeedClient, FrameOutcome, SnapshotSource, Transport};
pub use config::{InstrumentConfig, RecorderConfig};
pub use error::{ConfigError, FeedError, MessageError, SnapshotError, StoreError, TransportError};
pub use stats::{FeedStats, LatencyStats};
