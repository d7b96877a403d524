//! TOML configuration file loading
//!
//! Supports `~/.config/latch/config.toml` as a persistent config source.
//! All fields are optional — the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct LatchConfigFile {
    /// Data directory override (database lives here)
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Dispatcher tuning
    #[serde(default)]
    pub dispatch: DispatchFileConfig,

    /// Background refresh tuning
    #[serde(default)]
    pub refresh: RefreshFileConfig,

    /// Vendor cloud endpoints
    #[serde(default)]
    pub vendors: Vec<VendorFileConfig>,
}

/// Dispatcher configuration
#[derive(Debug, Default, Deserialize)]
pub struct DispatchFileConfig {
    /// "queue" or "fail_fast"
    pub contention: Option<String>,

    /// Waiters allowed behind an in-flight command in queue mode
    pub max_queue_depth: Option<usize>,

    /// Max adapter attempts per dispatch
    pub max_attempts: Option<u32>,

    /// Base backoff delay in milliseconds
    pub base_delay_ms: Option<u64>,

    /// Backoff ceiling in milliseconds
    pub max_delay_ms: Option<u64>,

    /// Per-call adapter deadline in seconds
    pub call_deadline_secs: Option<u64>,

    /// Confirm state assertions from a fresh cache entry
    pub cache_short_circuit: Option<bool>,

    /// Cache freshness window in seconds
    pub cache_ttl_secs: Option<u64>,
}

/// Background refresh configuration
#[derive(Debug, Default, Deserialize)]
pub struct RefreshFileConfig {
    /// Seconds between reconciliation passes
    pub interval_secs: Option<u64>,
}

/// One vendor cloud endpoint
#[derive(Debug, Deserialize)]
pub struct VendorFileConfig {
    /// Vendor name, matched against `Device::vendor`
    pub name: String,

    /// Base URL of the vendor API
    pub base_url: String,

    /// HTTP client timeout in seconds
    pub timeout_secs: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `LatchConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> LatchConfigFile {
    let Some(path) = config_file_path() else {
        return LatchConfigFile::default();
    };

    if !path.exists() {
        return LatchConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                LatchConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            LatchConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/latch/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("latch").join("config.toml"))
}
