/// Normalized feed events
///
/// Exchange frames are decoded into these before they reach the book.
/// Prices and sizes stay as exchange decimal strings until the feed client
/// parses them.

use chrono::{DateTime, Utc};

use crate::price_level::PriceLevel;

/// Instrument identity and persistence partition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProductInfo {
    pub id: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthUpdate {
    pub stream_key: String,
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub bids: Vec<(String, String)>,
    pub asks: Vec<(String, String)>,
    pub event_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeEvent {
    pub stream_key: String,
    pub price: String,
    pub size: String,
    pub event_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Server heartbeat that must be answered
    Ping,
    /// Connection/subscription acknowledgements and other bookkeeping
    Ignored(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    Depth(DepthUpdate),
    Trade(TradeEvent),
    Control(ControlEvent),
    /// Event type with no handler
    Unknown { stream_key: String, event_type: String },
}

/// Full book state fetched out of band
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BookSnapshot {
    pub sequence: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Parse an exchange price/size pair; `None` if either is not a finite decimal
pub fn parse_level(price: &str, size: &str) -> Option<(f64, f64)> {
    let price: f64 = price.trim().parse().ok()?;
    let size: f64 = size.trim().parse().ok()?;
    if price.is_finite() && size.is_finite() && price >= 0.0 && size >= 0.0 {
        Some((price, size))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("100.50", "0.00000000"), Some((100.5, 0.0)));
        assert_eq!(parse_level(" 1e2 ", "3"), Some((100.0, 3.0)));
        assert_eq!(parse_level("abc", "1"), None);
        assert_eq!(parse_level("1", "NaN"), None);
        assert_eq!(parse_level("-1", "1"), None);
    }
}
