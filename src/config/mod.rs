//! Configuration management for the Latch gateway

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::adapters::RetryPolicy;
use crate::dispatch::{ContentionMode, DispatchConfig};
use crate::{Error, Result};

/// Latch gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory (database lives here)
    pub data_dir: PathBuf,

    /// SQLite database path
    pub db_path: PathBuf,

    /// Dispatcher tuning
    pub dispatch: DispatchConfig,

    /// Interval between background state refresh passes
    pub refresh_interval: Duration,

    /// Vendor cloud endpoints to register adapters for
    pub vendors: Vec<VendorConfig>,
}

/// One vendor cloud endpoint
#[derive(Debug, Clone)]
pub struct VendorConfig {
    /// Vendor name, matched against `Device::vendor`
    pub name: String,

    /// Base URL of the vendor API
    pub base_url: String,

    /// HTTP client timeout
    pub request_timeout: Duration,
}

impl Config {
    /// Load configuration: env overrides > TOML file > defaults
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unparseable env values
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();

        let data_dir = std::env::var("LATCH_DATA_DIR")
            .ok()
            .or(fc.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);
        let db_path = data_dir.join("latch.db");

        let contention = match std::env::var("LATCH_CONTENTION")
            .ok()
            .or(fc.dispatch.contention)
        {
            None => ContentionMode::Queue,
            Some(s) => match s.as_str() {
                "queue" => ContentionMode::Queue,
                "fail_fast" => ContentionMode::FailFast,
                other => {
                    return Err(Error::Config(format!(
                        "unknown contention mode '{other}' (expected 'queue' or 'fail_fast')"
                    )));
                }
            },
        };

        let retry = RetryPolicy {
            max_attempts: env_parse("LATCH_MAX_ATTEMPTS")?
                .or(fc.dispatch.max_attempts)
                .unwrap_or(RetryPolicy::default().max_attempts),
            base_delay: env_parse("LATCH_BASE_DELAY_MS")?
                .or(fc.dispatch.base_delay_ms)
                .map_or(RetryPolicy::default().base_delay, Duration::from_millis),
            max_delay: env_parse("LATCH_MAX_DELAY_MS")?
                .or(fc.dispatch.max_delay_ms)
                .map_or(RetryPolicy::default().max_delay, Duration::from_millis),
        };

        let defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            contention,
            max_queue_depth: env_parse("LATCH_MAX_QUEUE_DEPTH")?
                .or(fc.dispatch.max_queue_depth)
                .unwrap_or(defaults.max_queue_depth),
            retry,
            call_deadline: env_parse("LATCH_CALL_DEADLINE_SECS")?
                .or(fc.dispatch.call_deadline_secs)
                .map_or(defaults.call_deadline, Duration::from_secs),
            cache_short_circuit: env_parse("LATCH_CACHE_SHORT_CIRCUIT")?
                .or(fc.dispatch.cache_short_circuit)
                .unwrap_or(defaults.cache_short_circuit),
            cache_ttl: env_parse("LATCH_CACHE_TTL_SECS")?
                .or(fc.dispatch.cache_ttl_secs)
                .map_or(defaults.cache_ttl, Duration::from_secs),
        };

        let refresh_interval = env_parse("LATCH_REFRESH_INTERVAL_SECS")?
            .or(fc.refresh.interval_secs)
            .map_or(Duration::from_secs(60), Duration::from_secs);

        let vendors = fc
            .vendors
            .into_iter()
            .map(|v| VendorConfig {
                name: v.name,
                base_url: v.base_url,
                request_timeout: Duration::from_secs(v.timeout_secs.unwrap_or(10)),
            })
            .collect();

        Ok(Self {
            data_dir,
            db_path,
            dispatch,
            refresh_interval,
            vendors,
        })
    }
}

/// Parse an env var into `T`, treating absence as `None` and garbage as an error
fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value for {name}: '{raw}'"))),
    }
}

/// Default data directory: `~/.local/share/latch` (platform equivalent)
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".latch"),
        |d| d.data_dir().join("latch"),
    )
}
