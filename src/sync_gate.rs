/// Sequence continuity gate
///
/// Classifies an incoming update range against the book's current sequence and
/// decides whether the update is applied, dropped as stale, or requires a
/// full resync from a fresh snapshot.

use crate::book::OrderBook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Apply the update. `newly_synced` is set when this update completed the
    /// post-snapshot sync window.
    Accept { newly_synced: bool },
    /// At least one update was missed; the book must be rebuilt
    ResyncRequired,
    /// Already applied or outside the sync window; drop it
    Stale,
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Updates carry a `[first, last]` id range that must extend the book
    /// without holes (Binance depth streams).
    RangeContinuity,
    /// Updates carry a timestamp used as sequence; anything not older than
    /// the current one is applied (Bitstamp diff channel).
    MonotonicTimestamp,
}

impl SyncPolicy {
    /// Whether an unsynced book's snapshot predates the stream: the update
    /// starts past `sequence + 1`, so no later update can straddle it.
    pub fn snapshot_behind(&self, book: &OrderBook, first: u64) -> bool {
        match self {
            SyncPolicy::RangeContinuity => !book.is_synced() && first > book.sequence().wrapping_add(1),
            SyncPolicy::MonotonicTimestamp => false,
        }
    }

    /// Classify `[first, last]` against the current `sequence`
    pub fn classify(&self, sequence: u64, synced: bool, first: u64, last: u64) -> Verdict {
        match self {
            SyncPolicy::RangeContinuity => {
                let next = sequence.wrapping_add(1);
                if first <= sequence {
                    Verdict::Stale
                } else if synced {
                    if first != next {
                        Verdict::ResyncRequired
                    } else {
                        Verdict::Accept { newly_synced: false }
                    }
                } else if first <= next && next <= last {
                    Verdict::Accept { newly_synced: true }
                } else {
                    Verdict::Stale
                }
            }
            SyncPolicy::MonotonicTimestamp => {
                if last < sequence {
                    Verdict::Stale
                } else {
                    Verdict::Accept { newly_synced: !synced }
                }
            }
        }
    }

    /// Classify and apply the sequence/sync transition to the book.
    /// Any non-stale verdict advances the sequence to `last`.
    pub fn admit(&self, book: &mut OrderBook, first: u64, last: u64) -> Verdict {
        let verdict = self.classify(book.sequence(), book.is_synced(), first, last);
        match verdict {
            Verdict::Stale => {}
            Verdict::ResyncRequired => {
                book.set_sequence(last);
                book.mark_unsynced();
            }
            Verdict::Accept { newly_synced } => {
                book.set_sequence(last);
                if newly_synced {
                    book.set_synced(true);
                }
            }
        }
        verdict
    }

    /// Whether applying a fetched snapshot is enough to trust the book
    pub fn synced_after_snapshot(&self) -> bool {
        match self {
            SyncPolicy::RangeContinuity => false,
            SyncPolicy::MonotonicTimestamp => true,
        }
    }
}
