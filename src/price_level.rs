/// Per-side price level table
///
/// Levels are keyed by fixed-point ticks so ordering and uniqueness are exact,
/// while the exchange-native f64 price is kept in the value and is what gets
/// serialized. Bids iterate best-first (descending), asks best-first (ascending).

use std::collections::BTreeMap;

/// Fixed-point scale for price keys: price * 10^8
pub const PRICE_SCALE: f64 = 1e8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Side::Bid),
            1 => Some(Side::Ask),
            _ => None,
        }
    }
}

/// A single price level. `size == 0.0` means the level is removed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

impl PriceLevel {
    pub fn new(price: f64, size: f64) -> Self {
        PriceLevel { price, size }
    }

    pub fn is_tombstone(&self) -> bool {
        self.size == 0.0
    }
}

/// Convert price to fixed-point key.
///
/// The tick is 1e-8: prices closer than half a tick share a key, so a table
/// holds at most one level per 1e-8 of price. Prices above
/// `u64::MAX / PRICE_SCALE` saturate to the top key.
pub fn price_to_fixed(price: f64) -> u64 {
    (price * PRICE_SCALE).round() as u64
}

/// Convert fixed-point key back to a float price
pub fn price_from_fixed(fixed: u64) -> f64 {
    fixed as f64 / PRICE_SCALE
}

#[derive(Debug, Clone)]
pub struct PriceTable {
    side: Side,
    levels: BTreeMap<u64, PriceLevel>,
}

impl PriceTable {
    pub fn new(side: Side) -> Self {
        PriceTable {
            side,
            levels: BTreeMap::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Upsert a level; a zero size removes it.
    /// Returns whether a level existed at this price before the call.
    pub fn update(&mut self, price: f64, size: f64) -> bool {
        let key = price_to_fixed(price);
        if size == 0.0 {
            self.levels.remove(&key).is_some()
        } else {
            self.levels.insert(key, PriceLevel::new(price, size)).is_some()
        }
    }

    pub fn contains(&self, price: f64) -> bool {
        self.levels.contains_key(&price_to_fixed(price))
    }

    pub fn get(&self, price: f64) -> Option<PriceLevel> {
        self.levels.get(&price_to_fixed(price)).copied()
    }

    /// Best level: highest bid or lowest ask
    pub fn best(&self) -> Option<PriceLevel> {
        match self.side {
            Side::Bid => self.levels.values().next_back().copied(),
            Side::Ask => self.levels.values().next().copied(),
        }
    }

    /// Iterate levels best-first
    pub fn iter(&self) -> Box<dyn Iterator<Item = &PriceLevel> + '_> {
        match self.side {
            Side::Bid => Box::new(self.levels.values().rev()),
            Side::Ask => Box::new(self.levels.values()),
        }
    }

    /// Top n levels, best-first
    pub fn top(&self, n: usize) -> Vec<PriceLevel> {
        self.iter().take(n).copied().collect()
    }

    /// Drop zero-size levels. Returns how many were removed.
    pub fn purge_tombstones(&mut self) -> usize {
        let before = self.levels.len();
        self.levels.retain(|_, level| !level.is_tombstone());
        before - self.levels.len()
    }

    /// Replace the whole table; zero-size input levels are skipped.
    pub fn replace<I>(&mut self, levels: I)
    where
        I: IntoIterator<Item = PriceLevel>,
    {
        self.levels.clear();
        for level in levels {
            if !level.is_tombstone() {
                self.levels.insert(price_to_fixed(level.price), level);
            }
        }
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}
