/// Feed statistics tracking
///
/// Counts what the feed client did with each frame (applied, stale, gap,
/// unknown) plus rolling book-update latency.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::info;

const WINDOW_SIZE: usize = 10000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p99_us: u64,
}

#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    start_time: Option<Instant>,
    total_messages: u64,
    total_bytes: u64,

    depth_updates: u64,
    trades: u64,
    stale_updates: u64,
    gap_events: u64,
    resyncs: u64,
    snapshot_failures: u64,
    stale_snapshots: u64,
    dropped_records: u64,
    unknown_events: u64,
    decode_errors: u64,
    malformed_levels: u64,
    reconnects: u64,

    book_update_latencies: VecDeque<u64>,
}

impl FeedStats {
    pub fn new() -> Self {
        FeedStats {
            book_update_latencies: VecDeque::with_capacity(WINDOW_SIZE),
            ..Default::default()
        }
    }

    /// Record a frame received
    pub fn record_message(&mut self, size: usize) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
        self.total_messages += 1;
        self.total_bytes += size as u64;
    }

    pub fn record_depth_update(&mut self) {
        self.depth_updates += 1;
    }

    pub fn record_trade(&mut self) {
        self.trades += 1;
    }

    pub fn record_stale(&mut self) {
        self.stale_updates += 1;
    }

    pub fn record_gap(&mut self) {
        self.gap_events += 1;
    }

    pub fn record_resync(&mut self) {
        self.resyncs += 1;
    }

    pub fn record_snapshot_failure(&mut self) {
        self.snapshot_failures += 1;
    }

    /// Fetched snapshot was already behind the live stream
    pub fn record_stale_snapshot(&mut self) {
        self.stale_snapshots += 1;
    }

    pub fn record_dropped_records(&mut self, count: u64) {
        self.dropped_records += count;
    }

    pub fn record_unknown_event(&mut self) {
        self.unknown_events += 1;
    }

    pub fn record_decode_error(&mut self) {
        self.decode_errors += 1;
    }

    pub fn record_malformed_level(&mut self) {
        self.malformed_levels += 1;
    }

    pub fn record_reconnect(&mut self) {
        self.reconnects += 1;
    }

    /// Record book update latency in microseconds
    pub fn record_book_update_latency(&mut self, micros: u64) {
        if self.book_update_latencies.len() >= WINDOW_SIZE {
            self.book_update_latencies.pop_front();
        }
        self.book_update_latencies.push_back(micros);
    }

    pub fn messages_per_sec(&self) -> f64 {
        match self.elapsed() {
            Some(elapsed) if elapsed.as_secs_f64() > 0.0 => {
                self.total_messages as f64 / elapsed.as_secs_f64()
            }
            _ => 0.0,
        }
    }

    pub fn book_update_latency_stats(&self) -> Option<LatencyStats> {
        if self.book_update_latencies.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.book_update_latencies.iter().copied().collect();
        sorted.sort_unstable();

        Some(LatencyStats {
            min_us: sorted[0],
            max_us: sorted[sorted.len() - 1],
            mean_us: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_us: sorted[sorted.len() / 2],
            p99_us: sorted[(sorted.len() * 99) / 100],
        })
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.start_time.map(|st| st.elapsed())
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn depth_updates(&self) -> u64 {
        self.depth_updates
    }

    pub fn trades(&self) -> u64 {
        self.trades
    }

    pub fn stale_updates(&self) -> u64 {
        self.stale_updates
    }

    pub fn gap_events(&self) -> u64 {
        self.gap_events
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    pub fn snapshot_failures(&self) -> u64 {
        self.snapshot_failures
    }

    pub fn stale_snapshots(&self) -> u64 {
        self.stale_snapshots
    }

    pub fn dropped_records(&self) -> u64 {
        self.dropped_records
    }

    pub fn unknown_events(&self) -> u64 {
        self.unknown_events
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    pub fn malformed_levels(&self) -> u64 {
        self.malformed_levels
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn reset(&mut self) {
        *self = FeedStats::new();
    }

    /// Log a statistics summary
    pub fn log_summary(&self, feed: &str) {
        info!(
            feed,
            messages = self.total_messages,
            bytes = self.total_bytes,
            msgs_per_sec = self.messages_per_sec(),
            depth_updates = self.depth_updates,
            trades = self.trades,
            stale = self.stale_updates,
            gaps = self.gap_events,
            resyncs = self.resyncs,
            stale_snapshots = self.stale_snapshots,
            dropped_records = self.dropped_records,
            unknown = self.unknown_events,
            reconnects = self.reconnects,
            "feed statistics"
        );

        if let Some(stats) = self.book_update_latency_stats() {
            info!(
                feed,
                min_us = stats.min_us,
                max_us = stats.max_us,
                mean_us = stats.mean_us,
                p50_us = stats.p50_us,
                p99_us = stats.p99_us,
                "book update latency"
            );
        }
    }
}
