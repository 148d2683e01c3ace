// ==============================================================================
// loader.rs - Sample Loader Pool
// ==============================================================================
// Description: Copies per-sample genotypes into per-loader group caches
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Loader lifecycle:
//   WaitingForTurn -> BuildingCache -> Ready -> Serving -> Done
//                  \-----------------\--------\--> Failed
//
// Loader i opens the genotype store only after loaders 0..i are ready, so
// at most one loader copies the group index at a time. Once ready it pulls
// sample ids from a shared queue until the queue is closed and drained.
// Any failure is reported to the coordinator, which cancels the pool.
// ==============================================================================

use crossbeam_channel::{unbounded, Receiver, Sender};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::barrier::ReadyFlags;
use crate::error::{PipelineError, PipelineResult};
use crate::grouping::GROUP_TABLE;
use crate::models::{GroupKey, GroupValue, SampleId};
use crate::shelf::{shelf_path, GenotypeSlice, Shelf};
use crate::store::{genotype_table, open_connection, retry_busy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    WaitingForTurn,
    BuildingCache,
    Ready,
    Serving,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    Ready {
        loader: usize,
    },
    Loaded {
        sample: SampleId,
        loader: usize,
        groups: usize,
    },
    Failed {
        sample: Option<SampleId>,
        loader: usize,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub project_db: PathBuf,
    pub genotype_db: PathBuf,
    pub shelf_dir: PathBuf,
    pub group_by: Vec<String>,
    /// SQL conditions on genotype table columns, combined with AND
    pub conditions: Vec<String>,
    pub busy_timeout: Duration,
    pub busy_retries: u32,
}

/// Samples in the caches and the loader that holds each one
#[derive(Debug, Clone, Default)]
pub struct LoadedSamples {
    pub ownership: HashMap<SampleId, usize>,
    pub shelves: Vec<PathBuf>,
}

/// Aborts the barrier if the loader exits without finishing
struct AbortGuard<'a> {
    barrier: &'a ReadyFlags,
    loader: usize,
    armed: bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.barrier
                .abort(&format!("loader {} stopped before finishing", self.loader));
        }
    }
}

struct Loader {
    index: usize,
    config: Arc<LoaderConfig>,
    state: LoaderState,
}

impl Loader {
    fn transition(&mut self, state: LoaderState) {
        debug!("Loader {}: {:?} -> {:?}", self.index, self.state, state);
        self.state = state;
    }

    /// Open the genotype store and copy the active part of the group index
    /// into an in-memory database attached as `cache`
    fn build_cache(&self) -> rusqlite::Result<Connection> {
        let conn = open_connection(&self.config.genotype_db, self.config.busy_timeout)?;
        conn.execute(
            "ATTACH DATABASE ?1 AS proj",
            [self.config.project_db.to_string_lossy()],
        )?;
        conn.execute_batch("ATTACH DATABASE ':memory:' AS cache;")?;
        conn.execute_batch(&format!(
            "CREATE TABLE cache.{table} AS SELECT variant_id, {fields} FROM proj.{table} WHERE _ignored = 0;
             CREATE INDEX cache.{table}_variant ON {table} (variant_id);
             DETACH DATABASE proj;",
            table = GROUP_TABLE,
            fields = self.config.group_by.join(", ")
        ))?;
        Ok(conn)
    }

    /// Write every group slice of one sample into the shelf
    fn load_sample(&self, conn: &Connection, shelf: &Shelf, sample: SampleId) -> rusqlite::Result<usize> {
        let fields: Vec<String> = self.config.group_by.iter().map(|f| format!("c.{}", f)).collect();
        let mut sql = format!(
            "SELECT g.variant_id, g.GT, {fields} FROM cache.{table} c, main.{geno} g \
             WHERE c.variant_id = g.variant_id",
            fields = fields.join(", "),
            table = GROUP_TABLE,
            geno = genotype_table(sample)
        );
        for condition in &self.config.conditions {
            sql.push_str(&format!(" AND ({})", condition));
        }
        sql.push_str(&format!(" ORDER BY {}", fields.join(", ")));

        shelf.begin()?;
        let result: rusqlite::Result<usize> = (|| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut current: Option<(GroupKey, GenotypeSlice)> = None;
            let mut groups = 0;
            while let Some(row) = rows.next()? {
                let variant: i64 = row.get(0)?;
                let code: Option<f64> = row.get(1)?;
                let key = GroupKey(
                    (0..fields.len())
                        .map(|i| row.get::<_, GroupValue>(i + 2))
                        .collect::<rusqlite::Result<Vec<_>>>()?,
                );
                match &mut current {
                    Some((k, slice)) if *k == key => {
                        slice.insert(variant as u64, code);
                    }
                    _ => {
                        if let Some((k, slice)) = current.take() {
                            shelf.put(sample, &k, &slice)?;
                            groups += 1;
                        }
                        let mut slice = GenotypeSlice::new();
                        slice.insert(variant as u64, code);
                        current = Some((key, slice));
                    }
                }
            }
            if let Some((k, slice)) = current {
                shelf.put(sample, &k, &slice)?;
                groups += 1;
            }
            Ok(groups)
        })();
        match result {
            Ok(groups) => {
                shelf.commit()?;
                Ok(groups)
            }
            Err(e) => {
                let _ = shelf.rollback();
                Err(e)
            }
        }
    }

    fn run(
        mut self,
        barrier: &ReadyFlags,
        samples: Receiver<SampleId>,
        events: Sender<LoaderEvent>,
        cancel: &AtomicBool,
    ) -> LoaderState {
        let mut guard = AbortGuard {
            barrier,
            loader: self.index,
            armed: true,
        };
        let index = self.index;
        let fail = |sample: Option<SampleId>, reason: String| {
            let _ = events.send(LoaderEvent::Failed {
                sample,
                loader: index,
                reason,
            });
            LoaderState::Failed
        };

        if let Err(e) = barrier.wait_for_predecessors(index) {
            debug!("Loader {} stopped while waiting: {}", index, e);
            return LoaderState::Failed;
        }
        self.transition(LoaderState::BuildingCache);
        let retries = self.config.busy_retries;
        let conn = match retry_busy(retries, || self.build_cache()) {
            Ok(conn) => conn,
            Err(e) => return fail(None, format!("cannot build group cache: {}", e)),
        };
        let shelf = match Shelf::create(&shelf_path(&self.config.shelf_dir, self.index)) {
            Ok(shelf) => shelf,
            Err(e) => return fail(None, format!("cannot create sample cache: {}", e)),
        };
        barrier.signal_ready(self.index);
        self.transition(LoaderState::Ready);
        let _ = events.send(LoaderEvent::Ready { loader: self.index });

        self.transition(LoaderState::Serving);
        for sample in samples.iter() {
            if cancel.load(Ordering::Relaxed) {
                debug!("Loader {} cancelled", self.index);
                break;
            }
            match retry_busy(retries, || self.load_sample(&conn, &shelf, sample)) {
                Ok(groups) => {
                    let _ = events.send(LoaderEvent::Loaded {
                        sample,
                        loader: self.index,
                        groups,
                    });
                }
                Err(e) => {
                    self.transition(LoaderState::Failed);
                    return fail(Some(sample), e.to_string());
                }
            }
        }
        guard.armed = false;
        self.transition(LoaderState::Done);
        self.state
    }
}

fn spawn_loader(
    index: usize,
    config: Arc<LoaderConfig>,
    barrier: Arc<ReadyFlags>,
    samples: Receiver<SampleId>,
    events: Sender<LoaderEvent>,
    cancel: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<LoaderState>> {
    thread::Builder::new().name(format!("loader-{}", index)).spawn(move || {
        let loader = Loader {
            index,
            config,
            state: LoaderState::WaitingForTurn,
        };
        loader.run(&barrier, samples, events, &cancel)
    })
}

/// Load every sample into the caches of `loaders` loader threads
///
/// Returns only when all samples are cached. The first failure cancels the
/// remaining loaders and is returned as [`PipelineError::EntityLoad`].
pub fn load_samples(config: LoaderConfig, loaders: usize, samples: &[SampleId]) -> PipelineResult<LoadedSamples> {
    let loaders = loaders.min(samples.len()).max(1);
    std::fs::create_dir_all(&config.shelf_dir)?;
    let shelves: Vec<PathBuf> = (0..loaders).map(|i| shelf_path(&config.shelf_dir, i)).collect();
    let config = Arc::new(config);
    let barrier = Arc::new(ReadyFlags::new(loaders));
    let cancel = Arc::new(AtomicBool::new(false));
    let (sample_tx, sample_rx) = unbounded();
    let (event_tx, event_rx) = unbounded();

    let mut handles = Vec::with_capacity(loaders);
    for index in 0..loaders {
        handles.push(spawn_loader(
            index,
            config.clone(),
            barrier.clone(),
            sample_rx.clone(),
            event_tx.clone(),
            cancel.clone(),
        )?);
    }
    drop(sample_rx);
    drop(event_tx);
    for sample in samples {
        // receivers are alive until the loaders exit
        let _ = sample_tx.send(*sample);
    }
    drop(sample_tx);
    info!("Loading {} samples with {} loaders", samples.len(), loaders);

    let mut ownership = HashMap::with_capacity(samples.len());
    let mut failure: Option<PipelineError> = None;
    while ownership.len() < samples.len() {
        match event_rx.recv() {
            Ok(LoaderEvent::Ready { loader }) => debug!("Loader {} ready", loader),
            Ok(LoaderEvent::Loaded { sample, loader, groups }) => {
                debug!("Sample {} cached by loader {} ({} groups)", sample, loader, groups);
                ownership.insert(sample, loader);
            }
            Ok(LoaderEvent::Failed { sample, loader, reason }) => {
                error!("Loader {} failed: {}", loader, reason);
                failure = Some(PipelineError::EntityLoad {
                    sample: sample.unwrap_or(-1),
                    loader,
                    reason,
                });
                break;
            }
            Err(_) => {
                failure = Some(PipelineError::WorkerFailed {
                    worker: "loader pool".to_string(),
                    reason: format!("stopped after loading {} of {} samples", ownership.len(), samples.len()),
                });
                break;
            }
        }
    }
    if failure.is_some() {
        cancel.store(true, Ordering::Relaxed);
        barrier.abort("sample loading failed");
    }

    let mut panicked = None;
    for (index, handle) in handles.into_iter().enumerate() {
        if handle.join().is_err() {
            panicked = Some(PipelineError::WorkerPanicked(format!("loader-{}", index)));
        }
    }
    if let Some(err) = failure.or(panicked) {
        for path in &shelves {
            let _ = std::fs::remove_file(path);
        }
        return Err(err);
    }
    Ok(LoadedSamples { ownership, shelves })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatSpec;
    use crate::grouping::build_group_index;
    use crate::importer::{import, ImportOptions};
    use crate::project::Project;

    fn setup(dir: &std::path::Path) -> (Project, Vec<SampleId>) {
        let project = Project::init(&dir.join("p"), "demo").unwrap();
        let path = dir.join("a.vcf");
        std::fs::write(
            &path,
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\tS3\n\
             1\t100\t.\tA\tG\t.\t.\t.\tGT\t0/1\t1/1\t./.\n\
             1\t200\t.\tC\tT\t.\t.\t.\tGT\t0/0\t0/1\t1/1\n\
             2\t300\t.\tG\tA\t.\t.\t.\tGT\t1/1\t./.\t0/1\n",
        )
        .unwrap();
        import(
            &project,
            ImportOptions {
                files: vec![path],
                format: FormatSpec::vcf(),
                sample_names: Vec::new(),
                force: false,
                jobs: 0,
            },
        )
        .unwrap();
        let store = project.store().unwrap();
        build_group_index(store.connection(), &["chr".to_string()]).unwrap();
        let samples = store.samples().unwrap().iter().map(|s| s.sample_id).collect();
        (project, samples)
    }

    fn config(project: &Project, conditions: Vec<String>) -> LoaderConfig {
        LoaderConfig {
            project_db: project.project_db(),
            genotype_db: project.genotype_db(),
            shelf_dir: project.scratch_dir(),
            group_by: vec!["chr".to_string()],
            conditions,
            busy_timeout: Duration::from_secs(5),
            busy_retries: 3,
        }
    }

    #[test]
    fn test_all_samples_are_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (project, samples) = setup(dir.path());
        let loaded = load_samples(config(&project, Vec::new()), 2, &samples).unwrap();
        assert_eq!(loaded.ownership.len(), 3);
        assert_eq!(loaded.shelves.len(), 2);

        let chr1 = GroupKey(vec![GroupValue::Text("1".into())]);
        let s1 = samples[0];
        let shelf = Shelf::open_read_only(&loaded.shelves[loaded.ownership[&s1]]).unwrap();
        let slice = shelf.get(s1, &chr1).unwrap().unwrap();
        // 0/1 -> 1 at the first variant, 0/0 -> 0 at the second
        assert_eq!(slice.values().copied().collect::<Vec<_>>(), vec![Some(1.0), Some(0.0)]);

        let s2 = samples[1];
        let shelf = Shelf::open_read_only(&loaded.shelves[loaded.ownership[&s2]]).unwrap();
        let chr2 = GroupKey(vec![GroupValue::Text("2".into())]);
        assert_eq!(shelf.get(s2, &chr2).unwrap(), None);
    }

    #[test]
    fn test_conditions_restrict_genotypes() {
        let dir = tempfile::tempdir().unwrap();
        let (project, samples) = setup(dir.path());
        let loaded = load_samples(config(&project, vec!["g.GT > 1".to_string()]), 1, &samples).unwrap();
        let shelf = Shelf::open_read_only(&loaded.shelves[0]).unwrap();
        let chr1 = GroupKey(vec![GroupValue::Text("1".into())]);
        assert_eq!(shelf.get(samples[0], &chr1).unwrap(), None);
        assert_eq!(
            shelf.get(samples[1], &chr1).unwrap().unwrap().len(),
            1
        );
    }

    #[test]
    fn test_read_failure_aborts_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let (project, samples) = setup(dir.path());
        let err = load_samples(config(&project, vec!["g.no_such_column = 1".to_string()]), 3, &samples)
            .unwrap_err();
        assert!(matches!(err, PipelineError::EntityLoad { .. }));
        // caches of an aborted run are removed
        assert!(!shelf_path(&project.scratch_dir(), 0).exists());
    }
}
