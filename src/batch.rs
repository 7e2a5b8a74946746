/// Per-instrument batch writer
///
/// Accumulates encoded records and decides when a book checkpoint is due:
/// a full Sync record every snapshot interval, otherwise a Diff record every
/// diff interval when something changed. Trades are appended as they happen.
/// Every checkpoint flushes the batch to the record store.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::book::{OrderBook, Trade};
use crate::codec::{encode_diff, encode_snapshot, encode_trade};
use crate::config::RecorderConfig;
use crate::error::StoreError;
use crate::event::ProductInfo;
use crate::store::RecordStore;

/// Unflushed records kept while the store is failing, in multiples of
/// `max_batch_records`. Older records are discarded beyond this.
pub const PENDING_BATCH_LIMIT: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct BatchState {
    /// Records appended since start
    pub count: u64,
    /// Encoded records not yet flushed, in order
    pub batch: Vec<Vec<u8>>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_diff_time: Option<DateTime<Utc>>,
    /// First sequence the next Diff record covers
    pub last_diff_sequence: u64,
    /// Records discarded because the store stayed unavailable
    pub dropped: u64,
}

/// What an evaluation wrote, if anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Snapshot,
    Diff,
    Nothing,
}

#[derive(Debug, Clone)]
pub struct BatchWriter {
    info: ProductInfo,
    snapshot_interval: TimeDelta,
    diff_interval: TimeDelta,
    max_batch_records: usize,
    state: BatchState,
    force_snapshot: bool,
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

impl BatchWriter {
    pub fn new(info: ProductInfo, config: &RecorderConfig) -> Self {
        BatchWriter {
            info,
            snapshot_interval: to_delta(config.snapshot_interval()),
            diff_interval: to_delta(config.diff_interval()),
            max_batch_records: config.max_batch_records.max(1),
            state: BatchState::default(),
            force_snapshot: false,
        }
    }

    pub fn info(&self) -> &ProductInfo {
        &self.info
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    pub fn pending_records(&self) -> usize {
        self.state.batch.len()
    }

    /// Emit a Sync record on the next evaluation regardless of the interval.
    /// Used after a resync so no Diff spans the discontinuity.
    pub fn request_snapshot(&mut self) {
        self.force_snapshot = true;
    }

    fn append(&mut self, record: Vec<u8>) {
        self.state.count += 1;
        self.state.batch.push(record);
    }

    /// Append a trade record immediately
    pub fn record_trade(&mut self, trade: &Trade, store: &dyn RecordStore, now: DateTime<Utc>) {
        self.append(encode_trade(trade));
        if self.state.batch.len() >= self.max_batch_records {
            self.flush_logged(store, now);
        }
    }

    pub fn should_snapshot(&self, now: DateTime<Utc>) -> bool {
        if self.force_snapshot {
            return true;
        }
        match self.state.last_sync_time {
            None => true,
            Some(last) => now.signed_duration_since(last) > self.snapshot_interval,
        }
    }

    pub fn should_diff(&self, now: DateTime<Utc>) -> bool {
        match self.state.last_diff_time.or(self.state.last_sync_time) {
            None => true,
            Some(last) => now.signed_duration_since(last) > self.diff_interval,
        }
    }

    /// Run the checkpoint guards after an applied event
    pub fn evaluate(&mut self, book: &mut OrderBook, store: &dyn RecordStore, now: DateTime<Utc>) -> Checkpoint {
        if self.should_snapshot(now) {
            self.write_snapshot(book, store, now);
            Checkpoint::Snapshot
        } else if self.should_diff(now) && self.write_diff(book, store, now) {
            Checkpoint::Diff
        } else {
            Checkpoint::Nothing
        }
    }

    pub fn write_snapshot(&mut self, book: &mut OrderBook, store: &dyn RecordStore, now: DateTime<Utc>) {
        book.purge_tombstones();
        self.append(encode_snapshot(book));
        book.reset_diff();
        self.state.last_diff_sequence = book.sequence().wrapping_add(1);
        self.state.last_sync_time = Some(now);
        self.force_snapshot = false;

        info!(
            book = book.id(),
            sequence = book.sequence(),
            count = self.state.count,
            "stored sync record"
        );
        self.flush_logged(store, now);
    }

    /// Write a Diff record if anything changed. Returns whether one was written.
    pub fn write_diff(&mut self, book: &mut OrderBook, store: &dyn RecordStore, now: DateTime<Utc>) -> bool {
        book.purge_tombstones();
        let diff = book.take_diff();
        if diff.is_empty() {
            return false;
        }

        let first = self.state.last_diff_sequence;
        let last = book.sequence();
        self.append(encode_diff(first, last, &diff));
        self.state.last_diff_sequence = last.wrapping_add(1);
        self.state.last_diff_time = Some(now);

        debug!(
            book = book.id(),
            first,
            last,
            levels = diff.level_count(),
            "stored diff record"
        );
        self.flush_logged(store, now);
        true
    }

    /// Write every pending record to the store in order.
    ///
    /// The batch is cleared only once all records are written; on failure the
    /// unwritten tail stays queued for the next flush.
    pub fn flush(&mut self, store: &dyn RecordStore, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut written = 0;
        let result = self
            .state
            .batch
            .iter()
            .try_for_each(|record| {
                store.write(now, &self.info.routing_key, record)?;
                written += 1;
                Ok::<(), StoreError>(())
            })
            .and_then(|_| store.sync());

        self.state.batch.drain(..written);
        result.map(|_| written)
    }

    /// Most records kept queued across failed flushes
    pub fn pending_limit(&self) -> usize {
        self.max_batch_records.saturating_mul(PENDING_BATCH_LIMIT)
    }

    fn flush_logged(&mut self, store: &dyn RecordStore, now: DateTime<Utc>) {
        if let Err(e) = self.flush(store, now) {
            warn!(
                routing_key = %self.info.routing_key,
                pending = self.state.batch.len(),
                error = %e,
                "batch flush failed, keeping records for next flush"
            );
            self.shed_oldest();
        }
    }

    fn shed_oldest(&mut self) {
        let limit = self.pending_limit();
        let excess = self.state.batch.len().saturating_sub(limit);
        if excess == 0 {
            return;
        }
        self.state.batch.drain(..excess);
        self.state.dropped += excess as u64;
        warn!(
            routing_key = %self.info.routing_key,
            dropped = excess,
            total_dropped = self.state.dropped,
            limit,
            "store unavailable, discarding oldest records"
        );
    }
}
