/// Error types for the recorder
///
/// Stale updates, sequence gaps and unknown events are not errors here: they
/// are verdicts handled inside the feed client. These types cover the
/// collaborator boundaries and configuration.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("not connected")]
    NotConnected,
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot request for {book} failed: {reason}")]
    Request { book: String, reason: String },

    #[error("malformed snapshot for {book}: {reason}")]
    Malformed { book: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid routing key: {0:?}")]
    InvalidRoutingKey(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors from decoding exchange JSON frames
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type FeedResult<T> = Result<T, FeedError>;
