//! Configuration surface.
//!
//! A JSON file declares the data directory, the optional durability
//! mirror, and one entry per asset. Ports never appear here: each asset
//! carries a logical `endpoint_name` that the serving layer resolves.
//! Validation happens once at startup and produces a read-only
//! [`Registry`]; a bad asset entry is rejected individually so the
//! remaining assets still run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::{AssetId, SlotSpec};

const DEFAULT_EXCHANGE: &str = "Coinbase";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("config file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config declares no assets")]
    NoAssets,

    #[error("asset '{pair}' is invalid: {reason}")]
    InvalidAsset { pair: String, reason: String },

    #[error("asset '{pair}' is declared more than once")]
    DuplicatePair { pair: String },

    #[error("endpoint name '{name}' is used by more than one asset")]
    DuplicateEndpointName { name: String },
}

/// Raw on-disk configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub sync: Option<SyncConfig>,
    pub assets: Vec<AssetEntry>,
}

/// Durability mirror settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub mirror_dir: PathBuf,
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
}

/// One asset's raw configuration entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetEntry {
    pub pair: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Upstream level-2 book endpoint; defaults to the exchange's book
    /// URL template for the pair.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Logical serving endpoint; the serving layer maps it to a port.
    pub endpoint_name: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_book_depth")]
    pub book_depth: usize,
    #[serde(default = "default_slot_hours")]
    pub slot_hours: u8,
    #[serde(default = "default_recent_window_hours")]
    pub recent_window_hours: u32,
    #[serde(default = "default_bucket_secs")]
    pub bucket_secs: u64,
    #[serde(default = "default_ma_windows")]
    pub ma_windows: Vec<usize>,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

fn default_exchange() -> String {
    String::from(DEFAULT_EXCHANGE)
}

fn default_sync_interval_secs() -> u64 {
    60
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_book_depth() -> usize {
    20
}

fn default_slot_hours() -> u8 {
    8
}

fn default_recent_window_hours() -> u32 {
    24
}

fn default_bucket_secs() -> u64 {
    60
}

fn default_ma_windows() -> Vec<usize> {
    vec![50, 100, 200]
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

/// Book endpoint template used when an entry omits `endpoint`.
pub fn default_endpoint(asset: &AssetId) -> String {
    format!(
        "https://api.exchange.coinbase.com/products/{}/book?level=2",
        asset.as_str()
    )
}

/// One asset's validated runtime settings.
#[derive(Debug, Clone)]
pub struct AssetRuntime {
    pub asset: AssetId,
    pub exchange: String,
    pub endpoint: String,
    pub endpoint_name: String,
    pub poll_interval: Duration,
    pub book_depth: usize,
    pub slot: SlotSpec,
    pub recent_window: time::Duration,
    pub bucket_secs: u64,
    pub ma_windows: Vec<usize>,
    pub fetch_timeout: Duration,
}

/// Read-only registry produced by startup validation.
///
/// `rejected` carries the per-asset errors for entries that failed
/// validation; their assets stay stopped while the rest run.
#[derive(Debug)]
pub struct Registry {
    pub data_dir: PathBuf,
    pub sync: Option<SyncConfig>,
    pub assets: Vec<AssetRuntime>,
    pub rejected: Vec<(String, ConfigError)>,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Validate into a registry. Workspace-level problems (no assets at
    /// all) fail outright; per-asset problems land in `rejected`.
    pub fn validate(&self) -> Result<Registry, ConfigError> {
        if self.assets.is_empty() {
            return Err(ConfigError::NoAssets);
        }

        let mut assets: Vec<AssetRuntime> = Vec::new();
        let mut rejected = Vec::new();

        for entry in &self.assets {
            match validate_entry(entry) {
                Ok(runtime) => {
                    if assets.iter().any(|a| a.asset == runtime.asset) {
                        rejected.push((
                            entry.pair.clone(),
                            ConfigError::DuplicatePair {
                                pair: entry.pair.clone(),
                            },
                        ));
                    } else if assets
                        .iter()
                        .any(|a| a.endpoint_name == runtime.endpoint_name)
                    {
                        rejected.push((
                            entry.pair.clone(),
                            ConfigError::DuplicateEndpointName {
                                name: runtime.endpoint_name.clone(),
                            },
                        ));
                    } else {
                        assets.push(runtime);
                    }
                }
                Err(error) => rejected.push((entry.pair.clone(), error)),
            }
        }

        Ok(Registry {
            data_dir: self.data_dir.clone(),
            sync: self.sync.clone(),
            assets,
            rejected,
        })
    }
}

fn validate_entry(entry: &AssetEntry) -> Result<AssetRuntime, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidAsset {
        pair: entry.pair.clone(),
        reason,
    };

    let asset = AssetId::parse(&entry.pair).map_err(|e| invalid(e.to_string()))?;
    let slot = SlotSpec::new(entry.slot_hours).map_err(|e| invalid(e.to_string()))?;

    let endpoint = match &entry.endpoint {
        Some(endpoint) => {
            let trimmed = endpoint.trim();
            if trimmed.is_empty() || !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
                return Err(invalid(format!("endpoint is not an http(s) URL: '{endpoint}'")));
            }
            trimmed.to_owned()
        }
        None => default_endpoint(&asset),
    };

    if entry.endpoint_name.trim().is_empty() {
        return Err(invalid(String::from("endpoint_name must not be empty")));
    }
    if entry.poll_interval_secs == 0 {
        return Err(invalid(String::from("poll_interval_secs must be positive")));
    }
    if entry.book_depth == 0 {
        return Err(invalid(String::from("book_depth must be positive")));
    }
    if entry.recent_window_hours == 0 {
        return Err(invalid(String::from("recent_window_hours must be positive")));
    }
    if entry.bucket_secs == 0 || 86_400 % entry.bucket_secs != 0 {
        return Err(invalid(format!(
            "bucket_secs must divide a day evenly, got {}",
            entry.bucket_secs
        )));
    }
    if entry.ma_windows.is_empty() || entry.ma_windows.iter().any(|&w| w == 0) {
        return Err(invalid(String::from(
            "ma_windows must be a non-empty list of positive window lengths",
        )));
    }
    if entry.fetch_timeout_ms == 0 {
        return Err(invalid(String::from("fetch_timeout_ms must be positive")));
    }

    Ok(AssetRuntime {
        asset,
        exchange: entry.exchange.clone(),
        endpoint,
        endpoint_name: entry.endpoint_name.trim().to_owned(),
        poll_interval: Duration::from_secs(entry.poll_interval_secs),
        book_depth: entry.book_depth,
        slot,
        recent_window: time::Duration::hours(i64::from(entry.recent_window_hours)),
        bucket_secs: entry.bucket_secs,
        ma_windows: entry.ma_windows.clone(),
        fetch_timeout: Duration::from_millis(entry.fetch_timeout_ms),
    })
}
