//! Process configuration, read from `DESKBOOK_*` environment variables.
//! Unset or unparsable values fall back to defaults.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;
const DEFAULT_COMPACT_INTERVAL_SECS: u64 = 60;
const WAL_FILE_NAME: &str = "deskbook.wal";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Compact once this many events were appended since the last compaction.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    /// Prometheus listener port. `None` disables the exporter.
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            compact_interval: Duration::from_secs(DEFAULT_COMPACT_INTERVAL_SECS),
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let data_dir = lookup("DESKBOOK_DATA_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let compact_threshold = lookup("DESKBOOK_COMPACT_THRESHOLD")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.compact_threshold);
        let compact_interval = lookup("DESKBOOK_COMPACT_INTERVAL_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.compact_interval);
        let metrics_port = lookup("DESKBOOK_METRICS_PORT").and_then(|s| s.parse().ok());
        Self {
            data_dir,
            compact_threshold,
            compact_interval,
            metrics_port,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }
}
