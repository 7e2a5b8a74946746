/// Trade aggressor side inference from top of book
///
/// Exchange maker/taker flags are not consistent across venues, so the side is
/// derived from where the print landed relative to the best bid and ask.

use crate::book::{OrderBook, TradeSide};

pub fn classify_side(price: f64, best_bid: Option<f64>, best_ask: Option<f64>) -> TradeSide {
    if let Some(ask) = best_ask {
        if price >= ask {
            return TradeSide::Buy;
        }
    }
    if let Some(bid) = best_bid {
        if price <= bid {
            return TradeSide::Sell;
        }
    }

    // inside the spread, or one side empty: nearer side wins, ties go to buy
    match (best_bid, best_ask) {
        (Some(bid), Some(ask)) => {
            if (price - bid).abs() < (price - ask).abs() {
                TradeSide::Sell
            } else {
                TradeSide::Buy
            }
        }
        (Some(_), None) => TradeSide::Sell,
        (None, Some(_)) => TradeSide::Buy,
        (None, None) => TradeSide::Unknown,
    }
}

/// Classify against a book's current top of book
pub fn side_for(book: &OrderBook, price: f64) -> TradeSide {
    classify_side(
        price,
        book.best_bid().map(|l| l.price),
        book.best_ask().map(|l| l.price),
    )
}
