/// Feed client scenarios against scripted transports and snapshot sources

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use book_recorder::{
    decode_record, BookSnapshot, Exchange, FeedClient, FileStore, FrameOutcome, MemoryStore, OrderBook, PriceLevel,
    ProductInfo, Record, RecordStore, RecorderConfig, Side, SnapshotError, TradeSide, Transport, TransportError,
};
use chrono::{DateTime, TimeDelta, Utc};

type Frame = Result<Option<String>, TransportError>;

/// Transport replaying one script per session. When the last script runs
/// dry it requests shutdown and reports the connection closed.
#[derive(Default)]
struct ScriptedTransport {
    sessions: VecDeque<VecDeque<Frame>>,
    current: VecDeque<Frame>,
    connects: Vec<String>,
    sent: Vec<String>,
    shutdown: Arc<OnceLock<Arc<AtomicBool>>>,
}

impl ScriptedTransport {
    fn with_sessions(sessions: Vec<Vec<Frame>>) -> Self {
        ScriptedTransport {
            sessions: sessions.into_iter().map(VecDeque::from).collect(),
            ..Default::default()
        }
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self, url: &str) -> Result<(), TransportError> {
        self.connects.push(url.to_string());
        self.current = self.sessions.pop_front().ok_or(TransportError::NotConnected)?;
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.sent.push(text.to_string());
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<String>, TransportError> {
        match self.current.pop_front() {
            Some(frame) => frame,
            None => {
                if self.sessions.is_empty() {
                    if let Some(flag) = self.shutdown.get() {
                        flag.store(true, Ordering::Relaxed);
                    }
                }
                Ok(None)
            }
        }
    }
}

fn snapshot_source(
    sequence: u64,
    fetches: Arc<AtomicUsize>,
) -> impl FnMut(Exchange, &ProductInfo) -> Result<BookSnapshot, SnapshotError> {
    move |_, _| {
        fetches.fetch_add(1, Ordering::SeqCst);
        Ok(BookSnapshot {
            sequence,
            bids: vec![PriceLevel::new(100.0, 1.0)],
            asks: vec![PriceLevel::new(101.0, 1.0)],
        })
    }
}

fn binance_depth(first: u64, last: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> String {
    let levels = |side: &[(&str, &str)]| {
        side.iter()
            .map(|(p, s)| format!(r#"["{}","{}"]"#, p, s))
            .collect::<Vec<_>>()
            .join(",")
    };
    format!(
        r#"{{"stream":"btcusdt@depth","data":{{"e":"depthUpdate","E":1700000000000,"s":"BTCUSDT","U":{},"u":{},"b":[{}],"a":[{}]}}}}"#,
        first,
        last,
        levels(bids),
        levels(asks)
    )
}

fn binance_trade(price: &str, qty: &str) -> String {
    format!(
        r#"{{"stream":"btcusdt@aggTrade","data":{{"e":"aggTrade","E":1700000003000,"s":"BTCUSDT","p":"{}","q":"{}","T":1700000003000,"m":false}}}}"#,
        price, qty
    )
}

fn bitstamp_diff(timestamp: u64, bids: &str, asks: &str) -> String {
    format!(
        r#"{{"event":"data","channel":"diff_order_book","data":"{{\"timestamp\":\"{}\",\"bids\":{},\"asks\":{}}}"}}"#,
        timestamp,
        bids.replace('"', "\\\""),
        asks.replace('"', "\\\"")
    )
}

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn at(seconds: i64) -> DateTime<Utc> {
    t0() + TimeDelta::seconds(seconds)
}

fn decoded(store: &MemoryStore, key: &str) -> Vec<Record> {
    store
        .records(key)
        .iter()
        .map(|r| decode_record(&r.bytes).unwrap().0)
        .collect()
}

fn binance_config() -> RecorderConfig {
    RecorderConfig::default().with_instruments(["BTC-USDT"])
}

#[test]
fn test_binance_sync_and_recording() {
    let store = Arc::new(MemoryStore::new());
    let fetches = Arc::new(AtomicUsize::new(0));
    let mut client = FeedClient::new(
        Exchange::Binance,
        &binance_config(),
        ScriptedTransport::default(),
        snapshot_source(10, fetches.clone()),
    )
    .unwrap()
    .with_store(store.clone());

    // first update only triggers the snapshot fetch
    assert_eq!(
        client.handle_frame_at(&binance_depth(5, 9, &[("99", "1")], &[]), at(0)),
        FrameOutcome::AwaitingSnapshot
    );
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert!(store.records("BTC-USDT").is_empty());

    assert_eq!(
        client.handle_frame_at(&binance_depth(11, 12, &[("100.5", "2")], &[]), at(0)),
        FrameOutcome::Applied
    );
    assert_eq!(
        client.handle_frame_at(&binance_depth(13, 14, &[("100.5", "3")], &[]), at(2)),
        FrameOutcome::Applied
    );
    assert_eq!(client.handle_frame_at(&binance_trade("101.0", "0.5"), at(3)), FrameOutcome::Applied);

    let book = client.book("BTC-USDT").unwrap();
    assert_eq!(book.last_trade().map(|t| t.side), Some(TradeSide::Buy));
    assert_eq!(client.batch_writer("BTC-USDT").map(|w| w.pending_records()), Some(1));

    client.flush_all(at(4));
    let records = decoded(&store, "BTC-USDT");
    assert_eq!(records.len(), 3);

    match &records[0] {
        Record::Sync { sequence, levels } => {
            assert_eq!(*sequence, 12);
            assert_eq!(levels.bids, vec![PriceLevel::new(100.5, 2.0), PriceLevel::new(100.0, 1.0)]);
            assert_eq!(levels.asks, vec![PriceLevel::new(101.0, 1.0)]);
        }
        other => panic!("expected sync, got {:?}", other),
    }
    match &records[1] {
        Record::Diff { first, last, levels, .. } => {
            assert_eq!((*first, *last), (13, 14));
            assert_eq!(levels.bids, vec![PriceLevel::new(100.5, 3.0)]);
            assert!(levels.asks.is_empty());
        }
        other => panic!("expected diff, got {:?}", other),
    }
    assert_eq!(
        records[2],
        Record::Trade {
            seq: 0,
            side: TradeSide::Buy,
            price: 101.0,
            size: 0.5
        }
    );
}

#[test]
fn test_gap_resyncs_and_resnapshots() {
    let store = Arc::new(MemoryStore::new());
    let fetches = Arc::new(AtomicUsize::new(0));
    let mut client = FeedClient::new(
        Exchange::Binance,
        &binance_config(),
        ScriptedTransport::default(),
        snapshot_source(10, fetches.clone()),
    )
    .unwrap()
    .with_store(store.clone());

    client.resync_all(at(0));
    assert_eq!(
        client.handle_frame_at(&binance_depth(11, 12, &[("100.5", "2")], &[]), at(0)),
        FrameOutcome::Applied
    );
    assert_eq!(
        client.handle_frame_at(&binance_depth(20, 21, &[("100.6", "2")], &[]), at(1)),
        FrameOutcome::ResyncTriggered
    );
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(client.stats().gap_events(), 1);
    assert_eq!(client.stats().resyncs(), 1);

    // the gap message itself was never applied
    let book = client.book("BTC-USDT").unwrap();
    assert!(!book.is_synced());
    assert_eq!(book.best_bid(), Some(PriceLevel::new(100.0, 1.0)));

    assert_eq!(
        client.handle_frame_at(&binance_depth(11, 11, &[], &[("101", "0")]), at(2)),
        FrameOutcome::Applied
    );

    let records = decoded(&store, "BTC-USDT");
    assert_eq!(records.len(), 2);
    match &records[1] {
        Record::Sync { sequence, levels } => {
            assert_eq!(*sequence, 11);
            assert!(levels.asks.is_empty());
        }
        other => panic!("expected a fresh sync after resync, got {:?}", other),
    }
}

#[test]
fn test_stale_updates_are_ignored() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let mut client = FeedClient::new(
        Exchange::Binance,
        &binance_config(),
        ScriptedTransport::default(),
        snapshot_source(10, fetches),
    )
    .unwrap();

    client.resync_all(at(0));
    assert_eq!(
        client.handle_frame_at(&binance_depth(11, 15, &[("100.5", "2")], &[]), at(0)),
        FrameOutcome::Applied
    );
    assert_eq!(
        client.handle_frame_at(&binance_depth(12, 14, &[("100.5", "9")], &[]), at(0)),
        FrameOutcome::Stale
    );

    let book = client.book("BTC-USDT").unwrap();
    assert_eq!(book.sequence(), 15);
    assert_eq!(book.best_bid(), Some(PriceLevel::new(100.5, 2.0)));
    assert_eq!(client.stats().stale_updates(), 1);
}

#[test]
fn test_bitstamp_monotonic_flow() {
    let store = Arc::new(MemoryStore::new());
    let fetches = Arc::new(AtomicUsize::new(0));
    let config = RecorderConfig::default().with_instruments(["BTC-USD"]);
    let mut client = FeedClient::new(
        Exchange::Bitstamp,
        &config,
        ScriptedTransport::default(),
        snapshot_source(1_700_000_000, fetches),
    )
    .unwrap()
    .with_store(store.clone());

    client.resync_all(at(0));
    assert!(client.book("BTC-USD").unwrap().is_synced());

    assert_eq!(
        client.handle_frame_at(&bitstamp_diff(1_700_000_001, r#"[["100.5","2"]]"#, "[]"), at(1)),
        FrameOutcome::Applied
    );
    assert_eq!(
        client.handle_frame_at(&bitstamp_diff(1_699_999_999, r#"[["100.7","2"]]"#, "[]"), at(1)),
        FrameOutcome::Stale
    );
    // equal timestamps are accepted
    assert_eq!(
        client.handle_frame_at(&bitstamp_diff(1_700_000_001, "[]", r#"[["101","0"]]"#), at(1)),
        FrameOutcome::Applied
    );

    let trade = r#"{"event":"trade","channel":"live_trades","data":"{\"price_str\":\"100.4\",\"amount_str\":\"0.1\",\"timestamp\":\"1700000002\"}"}"#;
    assert_eq!(client.handle_frame_at(trade, at(2)), FrameOutcome::Applied);

    let book = client.book("BTC-USD").unwrap();
    assert_eq!(book.sequence(), 1_700_000_001);
    assert_eq!(book.best_bid(), Some(PriceLevel::new(100.5, 2.0)));
    assert!(book.best_ask().is_none());
    assert_eq!(book.last_trade().map(|t| t.side), Some(TradeSide::Sell));
    assert_eq!(book.last_trade().map(|t| t.time.timestamp()), Some(1_700_000_002));

    client.flush_all(at(3));
    let records = decoded(&store, "BTC-USD");
    assert!(matches!(records[0], Record::Sync { sequence: 1_700_000_001, .. }));
    assert!(records.iter().any(|r| matches!(r, Record::Trade { side: TradeSide::Sell, .. })));
}

#[test]
fn test_bitstamp_control_frames() {
    let config = RecorderConfig::default().with_instruments(["BTC-USD", "ETH-EUR"]);
    let mut client = FeedClient::new(
        Exchange::Bitstamp,
        &config,
        ScriptedTransport::default(),
        snapshot_source(1, Arc::new(AtomicUsize::new(0))),
    )
    .unwrap();

    assert_eq!(
        client.handle_frame(r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"1.2\"}"}"#),
        FrameOutcome::Control
    );
    assert_eq!(
        client.handle_frame(r#"{"event":"pusher_internal:subscription_succeeded","channel":"live_trades","data":"{}"}"#),
        FrameOutcome::Control
    );
    assert!(client.transport().sent.is_empty());

    assert_eq!(client.handle_frame(r#"{"event":"pusher:ping","data":{}}"#), FrameOutcome::Control);
    assert_eq!(client.transport().sent.len(), 1);

    assert_eq!(
        client.book_for_stream("diff_order_book_etheur").map(|b| b.id()),
        Some("ETH-EUR")
    );
}

#[test]
fn test_unknown_and_unrouted_frames() {
    let mut client = FeedClient::new(
        Exchange::Binance,
        &binance_config(),
        ScriptedTransport::default(),
        snapshot_source(10, Arc::new(AtomicUsize::new(0))),
    )
    .unwrap();

    assert_eq!(
        client.handle_frame(r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","E":1}}"#),
        FrameOutcome::UnknownEvent
    );
    assert_eq!(
        client.handle_frame(r#"{"stream":"ethusdt@depth","data":{"e":"depthUpdate","E":1,"U":1,"u":2,"b":[],"a":[]}}"#),
        FrameOutcome::UnroutedStream
    );
    assert_eq!(client.handle_frame("not json"), FrameOutcome::Invalid);

    assert_eq!(client.stats().unknown_events(), 1);
    assert_eq!(client.stats().decode_errors(), 1);
    assert_eq!(client.stats().total_messages(), 3);
    assert!(client.is_awaiting_snapshot("BTC-USDT"));
}

#[test]
fn test_malformed_levels_are_skipped() {
    let mut client = FeedClient::new(
        Exchange::Binance,
        &binance_config(),
        ScriptedTransport::default(),
        snapshot_source(10, Arc::new(AtomicUsize::new(0))),
    )
    .unwrap();
    client.resync_all(at(0));

    let frame = binance_depth(11, 11, &[("abc", "1"), ("100.5", "2")], &[("101.5", "-1")]);
    assert_eq!(client.handle_frame_at(&frame, at(0)), FrameOutcome::Applied);

    let book = client.book("BTC-USDT").unwrap();
    assert_eq!(book.best_bid(), Some(PriceLevel::new(100.5, 2.0)));
    assert_eq!(book.ask_levels(), 1);
    assert_eq!(client.stats().malformed_levels(), 2);
}

#[test]
fn test_reconnect_resyncs_every_book() {
    let store = Arc::new(MemoryStore::new());
    let fetches = Arc::new(AtomicUsize::new(0));
    let transport = ScriptedTransport::with_sessions(vec![
        vec![
            Ok(Some(binance_depth(11, 12, &[("100.5", "2")], &[]))),
            Err(TransportError::Read("connection reset".to_string())),
        ],
        vec![Ok(Some(binance_depth(11, 13, &[("100.25", "4")], &[])))],
    ]);
    let shutdown_slot = transport.shutdown.clone();

    let mut client = FeedClient::new(
        Exchange::Binance,
        &binance_config(),
        transport,
        snapshot_source(10, fetches.clone()),
    )
    .unwrap()
    .with_store(store.clone());
    assert!(shutdown_slot.set(client.shutdown_handle()).is_ok());

    client.run();

    assert_eq!(client.transport().connects.len(), 2);
    assert!(client.transport().connects[0].ends_with("btcusdt@depth/btcusdt@aggTrade"));
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(client.stats().reconnects(), 1);

    // second session started from a fresh snapshot, so 100.5 is gone
    let book = client.book("BTC-USDT").unwrap();
    assert_eq!(book.sequence(), 13);
    assert_eq!(book.best_bid(), Some(PriceLevel::new(100.25, 4.0)));

    let syncs = decoded(&store, "BTC-USDT")
        .into_iter()
        .filter(|r| matches!(r, Record::Sync { .. }))
        .count();
    assert_eq!(syncs, 2);
}

#[test]
fn test_file_store_log_replays_to_live_book() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let mut client = FeedClient::new(
        Exchange::Binance,
        &binance_config(),
        ScriptedTransport::default(),
        snapshot_source(10, Arc::new(AtomicUsize::new(0))),
    )
    .unwrap()
    .with_store(store.clone());

    client.resync_all(at(0));
    let frames = [
        binance_depth(11, 12, &[("100.5", "2")], &[("101.5", "1")]),
        binance_depth(13, 15, &[("100", "0"), ("99.5", "3")], &[]),
        binance_depth(16, 16, &[("99.75", "1")], &[("101", "0")]),
        binance_depth(17, 18, &[("99.75", "0")], &[("102", "7")]),
    ];
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(client.handle_frame_at(frame, at(2 * i as i64)), FrameOutcome::Applied);
    }
    client.flush_all(at(10));

    let entries = store.read_all("BTC-USDT").unwrap();
    assert_eq!(entries.len(), frames.len());

    let mut replica = OrderBook::new("REPLICA");
    for entry in &entries {
        match decode_record(&entry.bytes).unwrap().0 {
            Record::Sync { sequence, levels } => replica.reset_from_snapshot(sequence, levels.bids, levels.asks),
            Record::Diff { last, levels, .. } => {
                for level in levels.bids {
                    replica.apply_level_update(Side::Bid, level.price, level.size);
                }
                for level in levels.asks {
                    replica.apply_level_update(Side::Ask, level.price, level.size);
                }
                replica.set_sequence(last);
            }
            Record::Trade { .. } => {}
        }
    }

    let live = client.book("BTC-USDT").unwrap();
    assert_eq!(replica.snapshot_view(), live.snapshot_view());
    assert_eq!(replica.sequence(), 18);
}

#[test]
fn test_clients_share_store_across_threads() {
    let store = Arc::new(MemoryStore::new());

    let handles: Vec<_> = ["BTC-USDT", "ETH-USDT"]
        .into_iter()
        .map(|id| {
            let store: Arc<dyn RecordStore> = store.clone();
            thread::spawn(move || {
                let config = RecorderConfig::default().with_instruments([id]);
                let mut client = FeedClient::new(
                    Exchange::Binance,
                    &config,
                    ScriptedTransport::default(),
                    snapshot_source(10, Arc::new(AtomicUsize::new(0))),
                )
                .unwrap()
                .with_store(store);
                client.resync_all(at(0));

                let stream = format!("{}@depth", id.replace('-', "").to_lowercase());
                for i in 0..50u64 {
                    let frame = binance_depth(11 + i, 11 + i, &[("100.5", "2")], &[]).replace("btcusdt@depth", &stream);
                    client.handle_frame_at(&frame, at(2 * i as i64));
                }
                client.flush_all(at(200));
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.routing_keys(), vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()]);
    for key in ["BTC-USDT", "ETH-USDT"] {
        let records = decoded(&store, key);
        assert!(matches!(records[0], Record::Sync { sequence: 11, .. }));
        let timestamps: Vec<_> = store.records(key).iter().map(|r| r.timestamp).collect();
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    }
}

#[test]
fn test_snapshot_behind_stream_is_refetched() {
    // the exchange's current update id, as its REST snapshot would report it
    let latest = Arc::new(AtomicU64::new(10));
    let fetches = Arc::new(AtomicUsize::new(0));
    let source = {
        let latest = latest.clone();
        let fetches = fetches.clone();
        move |_: Exchange, _: &ProductInfo| -> Result<BookSnapshot, SnapshotError> {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok(BookSnapshot {
                sequence: latest.load(Ordering::SeqCst),
                bids: vec![PriceLevel::new(100.0, 1.0)],
                asks: vec![PriceLevel::new(101.0, 1.0)],
            })
        }
    };
    let mut client = FeedClient::new(Exchange::Binance, &binance_config(), ScriptedTransport::default(), source).unwrap();
    client.resync_all(at(0));

    let mut outcomes = Vec::new();
    for i in 0..1000u64 {
        let (first, last) = (20 + 2 * i, 21 + 2 * i);
        latest.store(last, Ordering::SeqCst);
        outcomes.push(client.handle_frame_at(&binance_depth(first, last, &[("100.5", "2")], &[]), at(0)));
    }

    assert_eq!(outcomes[0], FrameOutcome::ResyncTriggered);
    assert!(outcomes[1..].iter().all(|o| *o == FrameOutcome::Applied));
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(client.stats().stale_snapshots(), 1);
    assert_eq!(client.stats().stale_updates(), 0);

    let book = client.book("BTC-USDT").unwrap();
    assert!(book.is_synced());
    assert_eq!(book.sequence(), 21 + 2 * 999);
}

#[test]
fn test_trades_on_unsynced_book_have_unknown_side() {
    let store = Arc::new(MemoryStore::new());
    let mut client = FeedClient::new(
        Exchange::Binance,
        &binance_config(),
        ScriptedTransport::default(),
        snapshot_source(10, Arc::new(AtomicUsize::new(0))),
    )
    .unwrap()
    .with_store(store.clone());

    // no snapshot yet
    assert_eq!(client.handle_frame_at(&binance_trade("101.0", "1"), at(0)), FrameOutcome::Applied);
    assert_eq!(client.book("BTC-USDT").unwrap().last_trade().map(|t| t.side), Some(TradeSide::Unknown));

    // snapshot applied, waiting for the straddling update
    client.resync_all(at(0));
    client.handle_frame_at(&binance_trade("101.0", "1"), at(0));
    assert_eq!(client.book("BTC-USDT").unwrap().last_trade().map(|t| t.side), Some(TradeSide::Unknown));

    client.handle_frame_at(&binance_depth(11, 11, &[("100.5", "2")], &[]), at(0));
    client.handle_frame_at(&binance_trade("101.0", "1"), at(0));
    assert_eq!(client.book("BTC-USDT").unwrap().last_trade().map(|t| t.side), Some(TradeSide::Buy));

    client.flush_all(at(1));
    let sides: Vec<_> = decoded(&store, "BTC-USDT")
        .into_iter()
        .filter_map(|r| match r {
            Record::Trade { side, .. } => Some(side),
            _ => None,
        })
        .collect();
    assert_eq!(sides, vec![TradeSide::Unknown, TradeSide::Unknown, TradeSide::Buy]);
}

#[test]
fn test_maker_flag_does_not_pick_side() {
    let mut client = FeedClient::new(
        Exchange::Binance,
        &binance_config(),
        ScriptedTransport::default(),
        snapshot_source(10, Arc::new(AtomicUsize::new(0))),
    )
    .unwrap();
    client.resync_all(at(0));
    client.handle_frame_at(&binance_depth(11, 11, &[], &[]), at(0));

    // buyer is maker, yet the print is at the bid
    let frame = binance_trade("100.0", "1").replace(r#""m":false"#, r#""m":true"#);
    client.handle_frame_at(&frame, at(0));
    assert_eq!(client.book("BTC-USDT").unwrap().last_trade().map(|t| t.side), Some(TradeSide::Sell));
}
