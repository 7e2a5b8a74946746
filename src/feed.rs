/// Per-exchange feed client
///
/// Owns the books of one exchange connection. Each text frame is decoded,
/// routed to its book by stream key, passed through the sync gate, applied,
/// and then handed to the book's batch writer. Stale updates, gaps and
/// unknown events are handled locally; only transport failures end a session,
/// and `run` simply starts a new one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::batch::BatchWriter;
use crate::book::{OrderBook, TradeSide};
use crate::classifier::side_for;
use crate::config::RecorderConfig;
use crate::error::{ConfigError, FeedResult, SnapshotError, TransportError};
use crate::event::{parse_level, BookSnapshot, ControlEvent, DepthUpdate, FeedMessage, ProductInfo, TradeEvent};
use crate::exchange::Exchange;
use crate::price_level::Side;
use crate::stats::FeedStats;
use crate::store::RecordStore;
use crate::sync_gate::{SyncPolicy, Verdict};

/// Streaming connection to an exchange. Reconnect backoff is the
/// implementation's concern.
pub trait Transport {
    fn connect(&mut self, url: &str) -> Result<(), TransportError>;

    fn send(&mut self, text: &str) -> Result<(), TransportError>;

    /// Next text frame, `None` once the connection closed
    fn recv(&mut self) -> Result<Option<String>, TransportError>;

    fn close(&mut self) {}
}

/// Out-of-band full book fetch
pub trait SnapshotSource {
    fn fetch(&mut self, exchange: Exchange, info: &ProductInfo) -> Result<BookSnapshot, SnapshotError>;
}

impl<F> SnapshotSource for F
where
    F: FnMut(Exchange, &ProductInfo) -> Result<BookSnapshot, SnapshotError>,
{
    fn fetch(&mut self, exchange: Exchange, info: &ProductInfo) -> Result<BookSnapshot, SnapshotError> {
        self(exchange, info)
    }
}

/// What happened to a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Applied,
    Stale,
    ResyncTriggered,
    /// Book is waiting for a snapshot; the update was dropped
    AwaitingSnapshot,
    UnroutedStream,
    UnknownEvent,
    Control,
    Invalid,
}

struct BookSlot {
    book: OrderBook,
    writer: BatchWriter,
    awaiting_snapshot: bool,
}

impl BookSlot {
    fn info(&self) -> &ProductInfo {
        self.writer.info()
    }
}

pub struct FeedClient<T, S> {
    exchange: Exchange,
    policy: SyncPolicy,
    transport: T,
    snapshots: S,
    store: Option<Arc<dyn RecordStore>>,
    slots: Vec<BookSlot>,
    routes: HashMap<String, usize>,
    streams: Vec<String>,
    stats: FeedStats,
    shutdown: Arc<AtomicBool>,
    connected_at: Option<DateTime<Utc>>,
}

impl<T: Transport, S: SnapshotSource> FeedClient<T, S> {
    pub fn new(exchange: Exchange, config: &RecorderConfig, transport: T, snapshots: S) -> FeedResult<Self> {
        config.validate()?;

        let mut slots = Vec::with_capacity(config.instruments.len());
        let mut routes = HashMap::new();
        let mut streams = Vec::new();

        for instrument in &config.instruments {
            let info = instrument.product_info();
            let keys = exchange.stream_keys(&info);
            let idx = slots.len();

            for key in [&keys.depth, &keys.trades] {
                if routes.insert(key.clone(), idx).is_some() {
                    return Err(ConfigError::Invalid(format!("duplicate stream key {}", key)).into());
                }
                streams.push(key.clone());
            }

            slots.push(BookSlot {
                book: OrderBook::with_trade_capacity(info.id.clone(), config.trade_history),
                writer: BatchWriter::new(info, config),
                awaiting_snapshot: true,
            });
        }

        info!(
            exchange = exchange.name(),
            books = slots.len(),
            streams = streams.len(),
            "feed client initialized"
        );

        Ok(FeedClient {
            exchange,
            policy: exchange.sync_policy(),
            transport,
            snapshots,
            store: None,
            slots,
            routes,
            streams,
            stats: FeedStats::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            connected_at: None,
        })
    }

    /// Enable recording. Without a store books are maintained but nothing
    /// is persisted.
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    /// Set to true to stop `run` after the current frame
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn stream_keys(&self) -> &[String] {
        &self.streams
    }

    pub fn book(&self, id: &str) -> Option<&OrderBook> {
        self.slots.iter().map(|s| &s.book).find(|b| b.id() == id)
    }

    /// Book routed from a stream key
    pub fn book_for_stream(&self, stream_key: &str) -> Option<&OrderBook> {
        self.routes.get(stream_key).map(|&idx| &self.slots[idx].book)
    }

    pub fn books(&self) -> impl Iterator<Item = &OrderBook> {
        self.slots.iter().map(|s| &s.book)
    }

    pub fn batch_writer(&self, id: &str) -> Option<&BatchWriter> {
        self.slots.iter().find(|s| s.book.id() == id).map(|s| &s.writer)
    }

    pub fn is_awaiting_snapshot(&self, id: &str) -> bool {
        self.slots
            .iter()
            .any(|s| s.book.id() == id && s.awaiting_snapshot)
    }

    pub fn stats(&self) -> &FeedStats {
        &self.stats
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run sessions until shutdown. Transport failures are logged and
    /// followed by a fresh session; pending batches are flushed on exit.
    pub fn run(&mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.run_session() {
                Ok(()) => info!(exchange = self.exchange.name(), "session ended"),
                Err(e) => error!(exchange = self.exchange.name(), error = %e, "session failed"),
            }
            self.transport.close();
            if !self.shutdown.load(Ordering::Relaxed) {
                self.stats.record_reconnect();
            }
        }
        self.flush_all(Utc::now());
        self.stats.log_summary(self.exchange.name());
    }

    /// Connect, subscribe, resync every book, then read until the connection
    /// closes, fails, or shutdown is requested.
    pub fn run_session(&mut self) -> FeedResult<()> {
        let url = self.exchange.endpoint(&self.streams);
        info!(exchange = self.exchange.name(), url = %url, "connecting");
        self.transport.connect(&url)?;

        for frame in self.exchange.subscribe_frames(&self.streams) {
            self.transport.send(&frame)?;
        }
        let now = Utc::now();
        self.connected_at = Some(now);
        self.resync_all(now);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            match self.transport.recv()? {
                Some(text) => {
                    self.handle_frame(&text);
                }
                None => return Ok(()),
            }
        }
    }

    /// Mark every book unsynced and fetch a fresh snapshot for each
    pub fn resync_all(&mut self, now: DateTime<Utc>) {
        for slot in &mut self.slots {
            slot.book.mark_unsynced();
            slot.awaiting_snapshot = true;
            Self::fetch_snapshot(self.exchange, self.policy, &mut self.snapshots, slot, &mut self.stats, now);
        }
    }

    fn fetch_snapshot(
        exchange: Exchange,
        policy: SyncPolicy,
        snapshots: &mut S,
        slot: &mut BookSlot,
        stats: &mut FeedStats,
        now: DateTime<Utc>,
    ) -> bool {
        match snapshots.fetch(exchange, slot.info()) {
            Ok(snapshot) => {
                slot.book
                    .reset_from_snapshot(snapshot.sequence, snapshot.bids, snapshot.asks);
                slot.book.set_synced(policy.synced_after_snapshot());
                slot.awaiting_snapshot = false;
                slot.writer.request_snapshot();
                info!(
                    book = slot.book.id(),
                    sequence = snapshot.sequence,
                    bids = slot.book.bid_levels(),
                    asks = slot.book.ask_levels(),
                    at = %now,
                    "snapshot applied"
                );
                true
            }
            Err(e) => {
                stats.record_snapshot_failure();
                warn!(book = slot.book.id(), error = %e, "snapshot fetch failed, will retry");
                false
            }
        }
    }

    pub fn handle_frame(&mut self, text: &str) -> FrameOutcome {
        self.handle_frame_at(text, Utc::now())
    }

    /// Process one text frame with an explicit clock
    pub fn handle_frame_at(&mut self, text: &str, now: DateTime<Utc>) -> FrameOutcome {
        self.stats.record_message(text.len());

        match self.exchange.decode(text) {
            Ok(FeedMessage::Depth(update)) => self.handle_depth(update, now),
            Ok(FeedMessage::Trade(trade)) => self.handle_trade(trade, now),
            Ok(FeedMessage::Control(ControlEvent::Ping)) => {
                if let Some(pong) = self.exchange.pong_frame() {
                    if let Err(e) = self.transport.send(&pong) {
                        warn!(exchange = self.exchange.name(), error = %e, "pong failed");
                    }
                }
                FrameOutcome::Control
            }
            Ok(FeedMessage::Control(ControlEvent::Ignored(event))) => {
                debug!(exchange = self.exchange.name(), event = %event, "control event");
                FrameOutcome::Control
            }
            Ok(FeedMessage::Unknown { stream_key, event_type }) => {
                self.stats.record_unknown_event();
                warn!(stream = %stream_key, event = %event_type, "unknown event");
                FrameOutcome::UnknownEvent
            }
            Err(e) => {
                self.stats.record_decode_error();
                warn!(exchange = self.exchange.name(), error = %e, "frame decode failed");
                FrameOutcome::Invalid
            }
        }
    }

    fn route(&self, stream_key: &str) -> Option<usize> {
        let idx = self.routes.get(stream_key).copied();
        if idx.is_none() {
            warn!(stream = %stream_key, "book not found");
        }
        idx
    }

    fn handle_depth(&mut self, update: DepthUpdate, now: DateTime<Utc>) -> FrameOutcome {
        let Some(idx) = self.route(&update.stream_key) else {
            return FrameOutcome::UnroutedStream;
        };
        let started = Instant::now();
        let slot = &mut self.slots[idx];

        if slot.awaiting_snapshot {
            Self::fetch_snapshot(self.exchange, self.policy, &mut self.snapshots, slot, &mut self.stats, now);
            return FrameOutcome::AwaitingSnapshot;
        }

        let (first, last) = (update.first_update_id, update.last_update_id);
        match self.policy.admit(&mut slot.book, first, last) {
            Verdict::Stale if self.policy.snapshot_behind(&slot.book, first) => {
                self.stats.record_stale_snapshot();
                warn!(
                    book = slot.book.id(),
                    first,
                    last,
                    sequence = slot.book.sequence(),
                    "snapshot behind stream, refetching"
                );
                slot.awaiting_snapshot = true;
                Self::fetch_snapshot(self.exchange, self.policy, &mut self.snapshots, slot, &mut self.stats, now);
                return FrameOutcome::ResyncTriggered;
            }
            Verdict::Stale => {
                self.stats.record_stale();
                debug!(
                    book = slot.book.id(),
                    first,
                    last,
                    sequence = slot.book.sequence(),
                    "ignoring stale update"
                );
                return FrameOutcome::Stale;
            }
            Verdict::ResyncRequired => {
                self.stats.record_gap();
                self.stats.record_resync();
                warn!(book = slot.book.id(), first, last, "update lost, resyncing");
                slot.awaiting_snapshot = true;
                Self::fetch_snapshot(self.exchange, self.policy, &mut self.snapshots, slot, &mut self.stats, now);
                return FrameOutcome::ResyncTriggered;
            }
            Verdict::Accept { newly_synced } => {
                if newly_synced {
                    info!(book = slot.book.id(), sequence = last, "book synced");
                }
            }
        }

        for (side, levels) in [(Side::Bid, &update.bids), (Side::Ask, &update.asks)] {
            for (price, size) in levels {
                match parse_level(price, size) {
                    Some((price, size)) => slot.book.apply_level_update(side, price, size),
                    None => {
                        self.stats.record_malformed_level();
                        warn!(book = slot.book.id(), price = %price, size = %size, "skipping malformed level");
                    }
                }
            }
        }

        self.stats.record_depth_update();
        self.stats
            .record_book_update_latency(started.elapsed().as_micros() as u64);

        if let Some(store) = self.store.as_deref() {
            let dropped = slot.writer.state().dropped;
            slot.writer.evaluate(&mut slot.book, store, now);
            self.stats.record_dropped_records(slot.writer.state().dropped - dropped);
        }
        FrameOutcome::Applied
    }

    fn handle_trade(&mut self, event: TradeEvent, now: DateTime<Utc>) -> FrameOutcome {
        let Some(idx) = self.route(&event.stream_key) else {
            return FrameOutcome::UnroutedStream;
        };
        let slot = &mut self.slots[idx];

        let Some((price, size)) = parse_level(&event.price, &event.size) else {
            self.stats.record_malformed_level();
            warn!(book = slot.book.id(), price = %event.price, size = %event.size, "skipping malformed trade");
            return FrameOutcome::Invalid;
        };

        // an unsynced book's top of book says nothing about the aggressor
        let trusted = slot.book.is_synced() && !slot.awaiting_snapshot;
        let side = if trusted {
            side_for(&slot.book, price)
        } else {
            TradeSide::Unknown
        };
        let trade = slot
            .book
            .record_trade(event.event_time.unwrap_or(now), side, price, size);
        self.stats.record_trade();

        if let Some(store) = self.store.as_deref() {
            let dropped = slot.writer.state().dropped;
            slot.writer.record_trade(&trade, store, now);
            if trusted {
                slot.writer.evaluate(&mut slot.book, store, now);
            }
            self.stats.record_dropped_records(slot.writer.state().dropped - dropped);
        }
        FrameOutcome::Applied
    }

    /// Flush every book's pending records. Best effort: failures are logged.
    pub fn flush_all(&mut self, now: DateTime<Utc>) {
        let Some(store) = self.store.as_deref() else {
            return;
        };
        for slot in &mut self.slots {
            if let Err(e) = slot.writer.flush(store, now) {
                warn!(book = slot.book.id(), error = %e, "final flush failed");
            }
        }
    }
}
