/// Synthetic market data feed generator
///
/// Drives a feed client with random Binance-style depth and trade frames and
/// records the book into a file store. Occasional skipped update ids force
/// the gap/resync path. Useful for eyeballing the record log and for
/// profiling.
///
/// Usage: feed_generator [output_dir] [frame_count]

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use book_recorder::{
    decode_stream, BookSnapshot, Exchange, FeedClient, FileStore, PriceLevel, ProductInfo, Record, RecorderConfig,
    SnapshotError, Transport, TransportError,
};
use rand::rngs::ThreadRng;
use rand::Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

const MID: f64 = 30_000.0;
const TICK: f64 = 0.5;

struct SyntheticFeed {
    rng: ThreadRng,
    remaining: usize,
    last_id: Arc<AtomicU64>,
}

impl SyntheticFeed {
    fn level(&mut self) -> String {
        let offset = self.rng.gen_range(1u32..40) as f64 * TICK;
        let size = if self.rng.gen_bool(0.2) {
            0.0
        } else {
            self.rng.gen_range(0.001..5.0)
        };
        if self.rng.gen_bool(0.5) {
            format!(r#""b":[["{:.2}","{:.4}"]],"a":[]"#, MID - offset, size)
        } else {
            format!(r#""b":[],"a":[["{:.2}","{:.4}"]]"#, MID + offset, size)
        }
    }

    fn next_frame(&mut self) -> String {
        if self.rng.gen_bool(0.1) {
            let price = MID + self.rng.gen_range(-20i32..20) as f64 * TICK;
            let qty = self.rng.gen_range(0.001..2.0);
            return format!(
                r#"{{"stream":"btcusdt@aggTrade","data":{{"e":"aggTrade","E":0,"p":"{:.2}","q":"{:.4}","m":false}}}}"#,
                price, qty
            );
        }

        // roughly one in two hundred updates skips ids
        let skip = if self.rng.gen_bool(0.005) { 5 } else { 0 };
        let span = self.rng.gen_range(1u64..4);
        let first = self.last_id.load(Ordering::SeqCst) + 1 + skip;
        let last = first + span - 1;
        self.last_id.store(last, Ordering::SeqCst);

        let levels = self.level();
        format!(
            r#"{{"stream":"btcusdt@depth","data":{{"e":"depthUpdate","E":0,"U":{},"u":{},{}}}}}"#,
            first, last, levels
        )
    }
}

impl Transport for SyntheticFeed {
    fn connect(&mut self, url: &str) -> Result<(), TransportError> {
        info!(url, "synthetic feed connected");
        Ok(())
    }

    fn send(&mut self, _text: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<String>, TransportError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(self.next_frame()))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let output_dir = args.get(1).cloned().unwrap_or_else(|| "/tmp/book_recorder".to_string());
    let frame_count: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10_000);

    let config = RecorderConfig {
        snapshot_interval_ms: 100,
        diff_interval_ms: 1,
        ..RecorderConfig::default()
    }
    .with_instruments(["BTC-USDT"])
    .from_env_overrides();

    let last_id = Arc::new(AtomicU64::new(1_000));
    let transport = SyntheticFeed {
        rng: rand::thread_rng(),
        remaining: frame_count,
        last_id: Arc::clone(&last_id),
    };

    let snapshot_id = Arc::clone(&last_id);
    let snapshots = move |_: Exchange, _: &ProductInfo| -> Result<BookSnapshot, SnapshotError> {
        let mut rng = rand::thread_rng();
        let levels = |side: f64, rng: &mut ThreadRng| {
            (1..=20)
                .map(|i| PriceLevel::new(MID + side * i as f64 * TICK, rng.gen_range(0.001..5.0)))
                .collect::<Vec<_>>()
        };
        Ok(BookSnapshot {
            sequence: snapshot_id.load(Ordering::SeqCst),
            bids: levels(-1.0, &mut rng),
            asks: levels(1.0, &mut rng),
        })
    };

    let store = Arc::new(FileStore::open(&output_dir)?);
    let mut client = FeedClient::new(Exchange::Binance, &config, transport, snapshots)?.with_store(store.clone());

    println!("Generating {} frames into {}", frame_count, output_dir);
    client.run_session()?;
    client.flush_all(chrono::Utc::now());
    client.stats().log_summary(client.exchange().name());

    let (mut syncs, mut diffs, mut trades) = (0usize, 0usize, 0usize);
    let mut bytes = 0usize;
    for entry in store.read_all("BTC-USDT")? {
        bytes += entry.bytes.len();
        decode_stream(&entry.bytes, |record| {
            match record {
                Record::Sync { .. } => syncs += 1,
                Record::Diff { .. } => diffs += 1,
                Record::Trade { .. } => trades += 1,
            }
            true
        })?;
    }

    println!("Recording complete: {} sync, {} diff, {} trade records", syncs, diffs, trades);
    println!("Record bytes: {}", bytes);
    Ok(())
}
