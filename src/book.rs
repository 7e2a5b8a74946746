/// Order book replica built from exchange price-level updates
///
/// Maintains bid/ask price level tables, the exchange sequence and sync flag,
/// a bounded trade history and the pending diff accumulated since the last
/// emitted checkpoint.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::price_level::{price_to_fixed, PriceLevel, PriceTable, Side};

pub const DEFAULT_TRADE_HISTORY: usize = 1000;

/// Aggressor side of a trade
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeSide {
    Buy = 0,
    Sell = 1,
    Unknown = 2,
}

impl TradeSide {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TradeSide::Buy),
            1 => Some(TradeSide::Sell),
            2 => Some(TradeSide::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trade {
    pub time: DateTime<Utc>,
    pub side: TradeSide,
    pub price: f64,
    pub size: f64,
}

/// Bid and ask levels, each best-first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookLevels {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl BookLevels {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn level_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct DiffEntry {
    level: PriceLevel,
    // whether the level was on the book when first touched after the checkpoint
    was_present: bool,
}

/// Last-write-wins accumulator of touched levels, keyed by price ticks
#[derive(Debug, Clone, Default)]
struct PendingDiff {
    bids: BTreeMap<u64, DiffEntry>,
    asks: BTreeMap<u64, DiffEntry>,
}

impl PendingDiff {
    fn record(&mut self, side: Side, level: PriceLevel, was_present: bool) {
        let map = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        map.entry(price_to_fixed(level.price))
            .and_modify(|entry| entry.level = level)
            .or_insert(DiffEntry { level, was_present });
    }

    fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    // A zero-size entry for a level the last checkpoint never saw is a stale
    // tombstone and is dropped; a zero-size entry for a level that existed is
    // the removal itself and is kept.
    fn purged(&self) -> BookLevels {
        fn keep(entry: &&DiffEntry) -> bool {
            !entry.level.is_tombstone() || entry.was_present
        }
        BookLevels {
            bids: self.bids.values().rev().filter(keep).map(|e| e.level).collect(),
            asks: self.asks.values().filter(keep).map(|e| e.level).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderBook {
    id: String,
    sequence: u64,
    synced: bool,
    bids: PriceTable,
    asks: PriceTable,
    pending: PendingDiff,
    trades: VecDeque<Trade>,
    trade_capacity: usize,
}

impl OrderBook {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_trade_capacity(id, DEFAULT_TRADE_HISTORY)
    }

    pub fn with_trade_capacity(id: impl Into<String>, trade_capacity: usize) -> Self {
        OrderBook {
            id: id.into(),
            sequence: 0,
            synced: false,
            bids: PriceTable::new(Side::Bid),
            asks: PriceTable::new(Side::Ask),
            pending: PendingDiff::default(),
            trades: VecDeque::with_capacity(trade_capacity.min(DEFAULT_TRADE_HISTORY)),
            trade_capacity: trade_capacity.max(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn set_synced(&mut self, synced: bool) {
        self.synced = synced;
    }

    pub fn mark_unsynced(&mut self) {
        self.synced = false;
    }

    /// Upsert or remove (`size == 0`) a level and record it in the pending diff
    pub fn apply_level_update(&mut self, side: Side, price: f64, size: f64) {
        let table = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        let was_present = table.update(price, size);
        self.pending.record(side, PriceLevel::new(price, size), was_present);
    }

    /// Replace both sides from a freshly fetched snapshot.
    ///
    /// Clears the pending diff and leaves the book unsynced; the sync policy
    /// decides whether the snapshot alone is enough.
    pub fn reset_from_snapshot(
        &mut self,
        sequence: u64,
        bids: impl IntoIterator<Item = PriceLevel>,
        asks: impl IntoIterator<Item = PriceLevel>,
    ) {
        self.bids.replace(bids);
        self.asks.replace(asks);
        self.pending.clear();
        self.sequence = sequence;
        self.synced = false;
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.best()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.best()
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) if bid.price < ask.price => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Top n levels on each side
    pub fn depth(&self, n: usize) -> BookLevels {
        BookLevels {
            bids: self.bids.top(n),
            asks: self.asks.top(n),
        }
    }

    pub fn record_trade(&mut self, time: DateTime<Utc>, side: TradeSide, price: f64, size: f64) -> Trade {
        if self.trades.len() >= self.trade_capacity {
            self.trades.pop_front();
        }
        let trade = Trade { time, side, price, size };
        self.trades.push_back(trade);
        trade
    }

    pub fn trades(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter()
    }

    pub fn last_trade(&self) -> Option<&Trade> {
        self.trades.back()
    }

    /// Remove zero-size levels from both tables
    pub fn purge_tombstones(&mut self) -> usize {
        self.bids.purge_tombstones() + self.asks.purge_tombstones()
    }

    /// Full tombstone-free view of both sides
    pub fn snapshot_view(&self) -> BookLevels {
        fn live(levels: &PriceTable) -> Vec<PriceLevel> {
            levels.iter().filter(|l| !l.is_tombstone()).copied().collect()
        }
        BookLevels {
            bids: live(&self.bids),
            asks: live(&self.asks),
        }
    }

    /// Take the pending diff, purged of stale tombstones, and clear it
    pub fn take_diff(&mut self) -> BookLevels {
        let diff = self.pending.purged();
        self.pending.clear();
        diff
    }

    pub fn reset_diff(&mut self) {
        self.pending.clear();
    }

    pub fn has_pending_diff(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }
}
