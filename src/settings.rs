// ==============================================================================
// settings.rs - Runtime Settings
// ==============================================================================
// Description: Tunables loaded from the project settings file and environment
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Precedence: defaults < <project>/settings.json < VPIPE_* environment
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::ConfigError;

/// Upper bound on loader threads when the count is derived from jobs
pub const MAX_DEFAULT_LOADERS: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Buffered genotype rows per sample before a bulk insert
    pub batch_size: usize,
    /// Bulk inserts between genotype database commits
    pub flushes_per_commit: u64,
    /// Records between project database commits during import
    pub commit_interval: u64,
    /// Merge heap capacity per reader thread
    pub heap_factor: usize,
    /// Seconds between result database commits
    pub result_commit_secs: u64,
    /// Per-group computation limit, unlimited when absent
    pub association_timeout_secs: Option<u64>,
    /// Loader threads; `min(8, workers)` when absent
    pub loaders: Option<usize>,
    /// Attempts for a query that hits a locked database
    pub busy_retries: u32,
    pub busy_timeout_ms: u64,
    /// Treat missing genotypes as reference calls instead of NaN
    pub treat_missing_as_wildtype: bool,
    /// Scratch directory for sample caches; `<project>/cache` when absent
    pub temp_dir: Option<PathBuf>,
    /// Keep sample cache files after a successful run
    pub keep_shelves: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flushes_per_commit: 10,
            commit_interval: 10_000,
            heap_factor: 4,
            result_commit_secs: 5,
            association_timeout_secs: None,
            loaders: None,
            busy_retries: 5,
            busy_timeout_ms: 5_000,
            treat_missing_as_wildtype: false,
            temp_dir: None,
            keep_shelves: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Setting(format!("{}={} is not valid", key, value))),
        Err(_) => Ok(None),
    }
}

impl Settings {
    /// Load settings from a JSON file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = if path.exists() {
            debug!("Loading settings from {}", path.display());
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str(&text)?
        } else {
            Settings::default()
        };
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Override values from `VPIPE_*` environment variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse("VPIPE_BATCH_SIZE")? {
            self.batch_size = v;
        }
        if let Some(v) = env_parse("VPIPE_COMMIT_INTERVAL")? {
            self.commit_interval = v;
        }
        if let Some(v) = env_parse("VPIPE_HEAP_FACTOR")? {
            self.heap_factor = v;
        }
        if let Some(v) = env_parse("VPIPE_LOADERS")? {
            self.loaders = Some(v);
        }
        if let Some(v) = env_parse("VPIPE_ASSOCIATION_TIMEOUT")? {
            self.association_timeout_secs = Some(v);
        }
        if let Some(v) = env_parse::<PathBuf>("VPIPE_TEMP_DIR")? {
            self.temp_dir = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Setting("batch_size must be positive".into()));
        }
        if self.heap_factor == 0 {
            return Err(ConfigError::Setting("heap_factor must be positive".into()));
        }
        if self.loaders == Some(0) {
            return Err(ConfigError::Setting("loaders must be positive".into()));
        }
        if self.flushes_per_commit == 0 || self.commit_interval == 0 {
            return Err(ConfigError::Setting("commit intervals must be positive".into()));
        }
        Ok(())
    }

    pub fn association_timeout(&self) -> Option<Duration> {
        self.association_timeout_secs.map(Duration::from_secs)
    }

    pub fn result_commit_interval(&self) -> Duration {
        Duration::from_secs(self.result_commit_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Number of loader threads for a run with `workers` group workers
    pub fn loader_count(&self, workers: usize) -> usize {
        self.loaders
            .unwrap_or_else(|| workers.min(MAX_DEFAULT_LOADERS))
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings.batch_size, 1000);
        assert_eq!(settings.result_commit_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"batch_size": 10, "association_timeout_secs": 30}"#).unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.heap_factor, 4);
        assert_eq!(settings.association_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings {
            loaders: Some(3),
            keep_shelves: true,
            ..Default::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap().loaders, Some(3));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let settings = Settings {
            batch_size: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_loader_count() {
        let settings = Settings::default();
        assert_eq!(settings.loader_count(3), 3);
        assert_eq!(settings.loader_count(20), 8);
        assert_eq!(settings.loader_count(0), 1);
    }
}
