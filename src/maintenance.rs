// ==============================================================================
// maintenance.rs - Index Maintenance
// ==============================================================================
// Description: Background creation of missing genotype table indexes
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::PipelineResult;
use crate::models::SampleId;
use crate::store::{retry_busy, GenotypeStore};

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub genotype_db: PathBuf,
    pub samples: Vec<SampleId>,
    pub busy_timeout: Duration,
    pub busy_retries: u32,
}

/// Index every sample table that lacks one, stopping early when `stop` is set
pub fn index_genotypes(config: &MaintenanceConfig, stop: &AtomicBool) -> PipelineResult<usize> {
    let store = GenotypeStore::open(&config.genotype_db, config.busy_timeout)?;
    let mut created = 0;
    for &sample in &config.samples {
        if stop.load(Ordering::Relaxed) {
            debug!("Index maintenance stopped after {} indexes", created);
            break;
        }
        if store.has_index(sample)? {
            continue;
        }
        match retry_busy(config.busy_retries, || store.create_index(sample)) {
            Ok(()) => created += 1,
            Err(e) => warn!("Failed to index genotypes of sample {}: {}", sample, e),
        }
    }
    Ok(created)
}

pub struct Maintenance {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<PipelineResult<usize>>,
}

impl Maintenance {
    pub fn spawn(config: MaintenanceConfig) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("maintenance".to_string())
            .spawn(move || index_genotypes(&config, &flag))?;
        Ok(Self { stop, handle })
    }

    /// Signal the thread and wait for it; returns the number of indexes built
    pub fn stop(self) -> usize {
        self.stop.store(true, Ordering::Relaxed);
        match self.handle.join() {
            Ok(Ok(created)) => created,
            Ok(Err(e)) => {
                warn!("Index maintenance failed: {}", e);
                0
            }
            Err(_) => {
                warn!("Index maintenance thread panicked");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir, samples: Vec<SampleId>) -> MaintenanceConfig {
        MaintenanceConfig {
            genotype_db: dir.path().join("g.DB"),
            samples,
            busy_timeout: Duration::from_secs(1),
            busy_retries: 2,
        }
    }

    #[test]
    fn test_missing_indexes_are_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, vec![1, 2]);
        let store = GenotypeStore::open(&cfg.genotype_db, cfg.busy_timeout).unwrap();
        store.create_table(1, true, &[]).unwrap();
        store.create_table(2, true, &[]).unwrap();
        store.create_index(2).unwrap();

        let stop = AtomicBool::new(false);
        assert_eq!(index_genotypes(&cfg, &stop).unwrap(), 1);
        assert!(store.has_index(1).unwrap());
        assert_eq!(index_genotypes(&cfg, &stop).unwrap(), 0);
    }

    #[test]
    fn test_stop_flag_ends_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, vec![1]);
        let store = GenotypeStore::open(&cfg.genotype_db, cfg.busy_timeout).unwrap();
        store.create_table(1, true, &[]).unwrap();

        let stop = AtomicBool::new(true);
        assert_eq!(index_genotypes(&cfg, &stop).unwrap(), 0);
        assert!(!store.has_index(1).unwrap());

        let maintenance = Maintenance::spawn(config(&dir, Vec::new())).unwrap();
        assert_eq!(maintenance.stop(), 0);
    }
}
