/// Supported exchanges and their wire decoding
///
/// The set of exchanges is closed: each variant knows its stream naming, its
/// subscription frames, how to turn a text frame into a normalized
/// `FeedMessage`, and which sequencing policy its depth stream follows.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::MessageError;
use crate::event::{parse_level, BookSnapshot, ControlEvent, DepthUpdate, FeedMessage, ProductInfo, TradeEvent};
use crate::price_level::PriceLevel;
use crate::sync_gate::SyncPolicy;

const BINANCE_STREAM_URL: &str = "wss://stream.binance.com:9443/stream?streams=";
const BINANCE_DEPTH_URL: &str = "https://api.binance.com/api/v3/depth";
const BITSTAMP_PUSHER_URL: &str =
    "wss://ws.pusherapp.com/app/de504dc5763aeef9ff52?protocol=7&client=js&version=2.1.6&flash=false";
const BITSTAMP_ORDER_BOOK_URL: &str = "https://www.bitstamp.net/api/v2/order_book";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    Binance,
    Bitstamp,
}

/// Depth and trade stream keys for one instrument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamKeys {
    pub depth: String,
    pub trades: String,
}

impl Exchange {
    pub fn name(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bitstamp => "bitstamp",
        }
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        match self {
            Exchange::Binance => SyncPolicy::RangeContinuity,
            Exchange::Bitstamp => SyncPolicy::MonotonicTimestamp,
        }
    }

    pub fn stream_keys(&self, info: &ProductInfo) -> StreamKeys {
        let symbol = compact_symbol(&info.id);
        match self {
            Exchange::Binance => StreamKeys {
                depth: format!("{}@depth", symbol),
                trades: format!("{}@aggTrade", symbol),
            },
            // the BTC-USD channels predate per-pair naming
            Exchange::Bitstamp if symbol == "btcusd" => StreamKeys {
                depth: "diff_order_book".to_string(),
                trades: "live_trades".to_string(),
            },
            Exchange::Bitstamp => StreamKeys {
                depth: format!("diff_order_book_{}", symbol),
                trades: format!("live_trades_{}", symbol),
            },
        }
    }

    /// Connection URL for the given stream keys
    pub fn endpoint(&self, streams: &[String]) -> String {
        match self {
            Exchange::Binance => format!("{}{}", BINANCE_STREAM_URL, streams.join("/")),
            Exchange::Bitstamp => BITSTAMP_PUSHER_URL.to_string(),
        }
    }

    /// Frames to send after connecting
    pub fn subscribe_frames(&self, streams: &[String]) -> Vec<String> {
        match self {
            // combined stream subscribes through the URL
            Exchange::Binance => Vec::new(),
            Exchange::Bitstamp => streams
                .iter()
                .map(|channel| {
                    json!({"event": "pusher:subscribe", "data": {"channel": channel}}).to_string()
                })
                .collect(),
        }
    }

    /// Reply to a server ping, if the protocol expects one at the text level
    pub fn pong_frame(&self) -> Option<String> {
        match self {
            Exchange::Binance => None,
            Exchange::Bitstamp => Some(json!({"event": "pusher:pong"}).to_string()),
        }
    }

    /// REST endpoint for a full depth snapshot
    pub fn snapshot_url(&self, info: &ProductInfo) -> String {
        let symbol = compact_symbol(&info.id);
        match self {
            Exchange::Binance => format!(
                "{}?symbol={}&limit=1000",
                BINANCE_DEPTH_URL,
                symbol.to_ascii_uppercase()
            ),
            Exchange::Bitstamp => format!("{}/{}", BITSTAMP_ORDER_BOOK_URL, symbol),
        }
    }

    pub fn decode(&self, text: &str) -> Result<FeedMessage, MessageError> {
        match self {
            Exchange::Binance => decode_binance(text),
            Exchange::Bitstamp => decode_bitstamp(text),
        }
    }

    /// Parse a REST depth snapshot body
    pub fn parse_snapshot(&self, body: &str) -> Result<BookSnapshot, MessageError> {
        match self {
            Exchange::Binance => {
                let raw: BinanceSnapshot = serde_json::from_str(body)?;
                Ok(BookSnapshot {
                    sequence: raw.last_update_id,
                    bids: snapshot_levels(raw.bids)?,
                    asks: snapshot_levels(raw.asks)?,
                })
            }
            Exchange::Bitstamp => {
                let raw: BitstampSnapshot = serde_json::from_str(body)?;
                Ok(BookSnapshot {
                    sequence: parse_u64("timestamp", &raw.timestamp)?,
                    bids: snapshot_levels(raw.bids)?,
                    asks: snapshot_levels(raw.asks)?,
                })
            }
        }
    }
}

fn compact_symbol(id: &str) -> String {
    id.replace('-', "").to_ascii_lowercase()
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, MessageError> {
    value.trim().parse().map_err(|_| MessageError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// Levels arrive as ["price", "size", ...]; extra elements are ignored
fn level_pairs(raw: Vec<Vec<Value>>) -> Result<Vec<(String, String)>, MessageError> {
    raw.iter()
        .map(|level| {
            let price = level.first().and_then(scalar_string);
            let size = level.get(1).and_then(scalar_string);
            match (price, size) {
                (Some(p), Some(s)) => Ok((p, s)),
                _ => Err(MessageError::InvalidField {
                    field: "level",
                    value: Value::Array(level.clone()).to_string(),
                }),
            }
        })
        .collect()
}

fn snapshot_levels(raw: Vec<Vec<Value>>) -> Result<Vec<PriceLevel>, MessageError> {
    level_pairs(raw)?
        .into_iter()
        .map(|(p, s)| {
            parse_level(&p, &s)
                .map(|(price, size)| PriceLevel::new(price, size))
                .ok_or(MessageError::InvalidField {
                    field: "level",
                    value: format!("[{}, {}]", p, s),
                })
        })
        .collect()
}

fn millis_to_time(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

// ── Binance ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct BinanceEnvelope {
    stream: String,
    data: Value,
}

#[derive(Deserialize)]
struct BinanceHeader {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "E", default)]
    event_time: Option<i64>,
}

#[derive(Deserialize)]
struct BinanceDepth {
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b", default)]
    bids: Vec<Vec<Value>>,
    #[serde(rename = "a", default)]
    asks: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct BinanceAggTrade {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T", default)]
    trade_time: Option<i64>,
}

#[derive(Deserialize)]
struct BinanceSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<Vec<Value>>,
    asks: Vec<Vec<Value>>,
}

fn decode_binance(text: &str) -> Result<FeedMessage, MessageError> {
    let envelope: BinanceEnvelope = serde_json::from_str(text)?;
    let header = BinanceHeader::deserialize(&envelope.data)?;
    let event_time = header.event_time.and_then(millis_to_time);

    match header.event_type.as_str() {
        "depthUpdate" => {
            let depth = BinanceDepth::deserialize(&envelope.data)?;
            Ok(FeedMessage::Depth(DepthUpdate {
                stream_key: envelope.stream,
                first_update_id: depth.first_update_id,
                last_update_id: depth.final_update_id,
                bids: level_pairs(depth.bids)?,
                asks: level_pairs(depth.asks)?,
                event_time,
            }))
        }
        "aggTrade" => {
            let trade = BinanceAggTrade::deserialize(&envelope.data)?;
            Ok(FeedMessage::Trade(TradeEvent {
                stream_key: envelope.stream,
                price: trade.price,
                size: trade.quantity,
                event_time: trade.trade_time.and_then(millis_to_time).or(event_time),
            }))
        }
        _ => Ok(FeedMessage::Unknown {
            stream_key: envelope.stream,
            event_type: header.event_type,
        }),
    }
}

// ── Bitstamp ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PusherPacket {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct BitstampDiff {
    timestamp: String,
    #[serde(default)]
    bids: Vec<Vec<Value>>,
    #[serde(default)]
    asks: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct BitstampTrade {
    price_str: String,
    amount_str: String,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct BitstampSnapshot {
    timestamp: String,
    bids: Vec<Vec<Value>>,
    asks: Vec<Vec<Value>>,
}

// Pusher wraps the payload in a JSON string
fn pusher_payload(data: Value) -> Result<Value, MessageError> {
    match data {
        Value::String(s) => Ok(serde_json::from_str(&s)?),
        other => Ok(other),
    }
}

fn decode_bitstamp(text: &str) -> Result<FeedMessage, MessageError> {
    let packet: PusherPacket = serde_json::from_str(text)?;

    match packet.event.as_str() {
        "pusher:ping" => return Ok(FeedMessage::Control(ControlEvent::Ping)),
        e if e.starts_with("pusher") => {
            return Ok(FeedMessage::Control(ControlEvent::Ignored(packet.event)));
        }
        _ => {}
    }

    let stream_key = packet.channel.ok_or(MessageError::MissingField("channel"))?;

    match packet.event.as_str() {
        "data" => {
            let diff = BitstampDiff::deserialize(pusher_payload(packet.data)?)?;
            let seq = parse_u64("timestamp", &diff.timestamp)?;
            Ok(FeedMessage::Depth(DepthUpdate {
                stream_key,
                first_update_id: seq,
                last_update_id: seq,
                bids: level_pairs(diff.bids)?,
                asks: level_pairs(diff.asks)?,
                event_time: i64::try_from(seq).ok().and_then(|s| DateTime::from_timestamp(s, 0)),
            }))
        }
        "trade" => {
            let trade = BitstampTrade::deserialize(pusher_payload(packet.data)?)?;
            let event_time = trade
                .timestamp
                .as_deref()
                .and_then(|t| t.trim().parse::<i64>().ok())
                .and_then(|s| DateTime::from_timestamp(s, 0));
            Ok(FeedMessage::Trade(TradeEvent {
                stream_key,
                price: trade.price_str,
                size: trade.amount_str,
                event_time,
            }))
        }
        _ => Ok(FeedMessage::Unknown {
            stream_key,
            event_type: packet.event,
        }),
    }
}
