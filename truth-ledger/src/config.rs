//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Upper bound on waiting for a stream's writer lock (milliseconds)
    pub lock_timeout_ms: u64,

    /// Raw response excerpts are truncated to this many bytes; 0 drops them
    pub raw_response_max_bytes: usize,

    /// Default uptime window (hours)
    pub default_window_hours: i64,

    /// Number of recent check hashes attached to a discrepancy as proof
    pub proof_hash_count: usize,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/truth-ledger"),
            service_name: "truth-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            lock_timeout_ms: 5_000,
            raw_response_max_bytes: 1024,
            default_window_hours: 24,
            proof_hash_count: 10,
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// fsync the WAL on every insertion
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 16,
            max_write_buffer_number: 2,
            max_background_jobs: 2,
            sync_writes: true,
            enable_statistics: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(timeout) = std::env::var("LEDGER_LOCK_TIMEOUT_MS") {
            config.lock_timeout_ms = timeout.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid LEDGER_LOCK_TIMEOUT_MS: {}", e))
            })?;
        }

        if let Ok(max) = std::env::var("LEDGER_RAW_RESPONSE_MAX_BYTES") {
            config.raw_response_max_bytes = max.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid LEDGER_RAW_RESPONSE_MAX_BYTES: {}", e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store cannot honour
    pub fn validate(&self) -> crate::Result<()> {
        if self.lock_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.default_window_hours <= 0 {
            return Err(crate::Error::Config(
                "default_window_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Lock timeout as a `Duration`
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
