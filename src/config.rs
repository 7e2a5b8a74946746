/// Recorder configuration
///
/// Loaded from TOML, with a couple of environment overrides for the
/// checkpoint cadence.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::event::ProductInfo;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstrumentConfig {
    /// Exchange product id, e.g. "BTC-USDT"
    pub id: String,
    /// Persistence partition; defaults to the id
    #[serde(default)]
    pub routing_key: Option<String>,
}

impl InstrumentConfig {
    pub fn new(id: impl Into<String>) -> Self {
        InstrumentConfig {
            id: id.into(),
            routing_key: None,
        }
    }

    pub fn product_info(&self) -> ProductInfo {
        ProductInfo {
            id: self.id.clone(),
            routing_key: self.routing_key.clone().unwrap_or_else(|| self.id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Full snapshot cadence
    pub snapshot_interval_ms: u64,
    /// Diff cadence between snapshots
    pub diff_interval_ms: u64,
    /// Flush once a batch holds this many records
    pub max_batch_records: usize,
    /// Trades kept in memory per book
    pub trade_history: usize,
    pub instruments: Vec<InstrumentConfig>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: 60_000,
            diff_interval_ms: 1_000,
            max_batch_records: 1_000,
            trade_history: 1_000,
            instruments: Vec::new(),
        }
    }
}

impl RecorderConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: RecorderConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RECORDER_SNAPSHOT_INTERVAL_MS` / `RECORDER_DIFF_INTERVAL_MS`
    pub fn from_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("RECORDER_SNAPSHOT_INTERVAL_MS") {
            self.snapshot_interval_ms = v.parse().unwrap_or(self.snapshot_interval_ms);
        }
        if let Ok(v) = std::env::var("RECORDER_DIFF_INTERVAL_MS") {
            self.diff_interval_ms = v.parse().unwrap_or(self.diff_interval_ms);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot_interval_ms == 0 {
            return Err(ConfigError::Invalid("snapshot_interval_ms must be > 0".into()));
        }
        if self.diff_interval_ms == 0 {
            return Err(ConfigError::Invalid("diff_interval_ms must be > 0".into()));
        }
        if self.max_batch_records == 0 {
            return Err(ConfigError::Invalid("max_batch_records must be > 0".into()));
        }
        if let Some(bad) = self.instruments.iter().find(|i| i.id.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("empty instrument id: {:?}", bad)));
        }
        Ok(())
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn diff_interval(&self) -> Duration {
        Duration::from_millis(self.diff_interval_ms)
    }

    pub fn with_instruments<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instruments = ids.into_iter().map(InstrumentConfig::new).collect();
        self
    }
}
