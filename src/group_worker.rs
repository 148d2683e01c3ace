// ==============================================================================
// group_worker.rs - Group Worker Pool
// ==============================================================================
// Description: Workers that assemble group genotype matrices and run methods
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Workers open their connections, signal ready and wait until every worker
// is ready before taking groups from the queue. A failing group never stops
// a worker: it is reported with NaN values and the worker moves on.
// ==============================================================================

use crossbeam_channel::{Receiver, Sender};
use rusqlite::Connection;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::barrier::ReadyFlags;
use crate::error::{GroupError, PipelineError, PipelineResult};
use crate::grouping::variants_of_group;
use crate::methods::{AssociationData, AssociationTest, Deadline, MethodSpec};
use crate::models::{GroupKey, SampleId, VariantId};
use crate::shelf::Shelf;
use crate::store::open_read_only;

/// Groups with fewer samples left after filtering are reported as failed
pub const MIN_SAMPLES: usize = 5;

/// Genotype code that is recoded before computation (double heterozygote)
const DOUBLE_HET_CODE: f64 = -1.0;
const DOUBLE_HET_VALUE: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MissingnessFilter {
    /// Samples are kept when their missing rate is below this
    pub discard_samples: f64,
    /// Loci are kept when their missing rate is below this
    pub discard_variants: f64,
}

impl Default for MissingnessFilter {
    fn default() -> Self {
        Self {
            discard_samples: 1.0,
            discard_variants: 1.0,
        }
    }
}

impl MissingnessFilter {
    /// A threshold of 0 keeps only complete rows, not nothing
    pub fn new(discard_samples: Option<f64>, discard_variants: Option<f64>) -> Self {
        let threshold = |t: Option<f64>| match t {
            Some(t) if t <= 0.0 => 1e-8,
            Some(t) => t,
            None => 1.0,
        };
        Self {
            discard_samples: threshold(discard_samples),
            discard_variants: threshold(discard_variants),
        }
    }

    /// Drop incomplete samples, then uninformative loci
    pub fn apply(&self, matrix: &[Vec<f64>], phenotype: &[f64]) -> Result<AssociationData, GroupError> {
        let n_loci = matrix.first().map(Vec::len).unwrap_or(0);
        if n_loci == 0 {
            return Err(GroupError::NoVariants);
        }
        let samples: Vec<usize> = matrix
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                let missing = row.iter().filter(|v| v.is_nan()).count();
                (missing as f64 / n_loci as f64) < self.discard_samples
            })
            .map(|(i, _)| i)
            .collect();
        if samples.len() < MIN_SAMPLES {
            return Err(GroupError::TooFewSamples(samples.len()));
        }

        let loci: Vec<usize> = (0..n_loci)
            .filter(|&j| {
                let mut missing = 0usize;
                let mut codes = BTreeSet::new();
                for &i in &samples {
                    let v = matrix[i][j];
                    if v.is_nan() {
                        missing += 1;
                    } else {
                        codes.insert(v.to_bits());
                    }
                }
                (missing as f64 / samples.len() as f64) < self.discard_variants && codes.len() > 1
            })
            .collect();
        if loci.is_empty() {
            return Err(GroupError::NoVariants);
        }

        Ok(AssociationData {
            genotypes: samples
                .iter()
                .map(|&i| loci.iter().map(|&j| matrix[i][j]).collect())
                .collect(),
            phenotype: samples.iter().map(|&i| phenotype[i]).collect(),
        })
    }
}

/// Outcome of one group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupResult {
    pub key: GroupKey,
    pub sample_count: usize,
    pub variant_count: usize,
    pub values: Vec<f64>,
    pub error: Option<GroupError>,
}

impl GroupResult {
    /// All-NaN results count as failed
    pub fn is_failed(&self) -> bool {
        self.values.iter().all(|v| v.is_nan())
    }
}

/// Read-only state shared by all group workers
#[derive(Debug, Clone)]
pub struct GroupContext {
    pub project_db: PathBuf,
    pub group_by: Vec<String>,
    /// Samples in matrix row order
    pub samples: Vec<SampleId>,
    /// Phenotype of each sample, same order
    pub phenotype: Vec<f64>,
    /// Loader (and therefore shelf) holding each sample
    pub ownership: HashMap<SampleId, usize>,
    pub shelves: Vec<PathBuf>,
    pub methods: Vec<MethodSpec>,
    pub filter: MissingnessFilter,
    pub treat_missing_as_wildtype: bool,
    pub timeout: Option<Duration>,
    pub busy_timeout: Duration,
}

struct GroupWorker {
    ctx: Arc<GroupContext>,
    conn: Connection,
    shelves: Vec<Shelf>,
    methods: Vec<Box<dyn AssociationTest>>,
    width: usize,
}

impl GroupWorker {
    fn open(ctx: Arc<GroupContext>) -> PipelineResult<Self> {
        let conn = open_read_only(&ctx.project_db, ctx.busy_timeout)?;
        let shelves = ctx
            .shelves
            .iter()
            .map(|p| Shelf::open_read_only(p))
            .collect::<PipelineResult<Vec<_>>>()?;
        let methods: Vec<Box<dyn AssociationTest>> = ctx.methods.iter().map(MethodSpec::build).collect();
        let width = methods.iter().map(|m| m.fields().len()).sum();
        Ok(Self {
            ctx,
            conn,
            shelves,
            methods,
            width,
        })
    }

    fn genotype_matrix(&self, key: &GroupKey, variants: &[VariantId]) -> Result<Vec<Vec<f64>>, GroupError> {
        let missing = if self.ctx.treat_missing_as_wildtype { 0.0 } else { f64::NAN };
        let mut matrix = Vec::with_capacity(self.ctx.samples.len());
        for sample in &self.ctx.samples {
            let loader = *self
                .ctx
                .ownership
                .get(sample)
                .ok_or_else(|| GroupError::Data(format!("sample {} is not cached", sample)))?;
            let shelf = self
                .shelves
                .get(loader)
                .ok_or_else(|| GroupError::Data(format!("no cache for loader {}", loader)))?;
            let slice = shelf.get(*sample, key)?;
            let row = variants
                .iter()
                .map(|v| match slice.as_ref().and_then(|s| s.get(v).copied()).flatten() {
                    Some(code) if code == DOUBLE_HET_CODE => DOUBLE_HET_VALUE,
                    Some(code) => code,
                    None => missing,
                })
                .collect();
            matrix.push(row);
        }
        Ok(matrix)
    }

    fn compute(&mut self, key: &GroupKey) -> Result<GroupResult, GroupError> {
        let deadline = self.ctx.timeout.map(Deadline::after);
        let variants = variants_of_group(&self.conn, "main", &self.ctx.group_by, key)
            .map_err(|e| GroupError::Data(e.to_string()))?;
        let matrix = self.genotype_matrix(key, &variants)?;
        let data = self.ctx.filter.apply(&matrix, &self.ctx.phenotype)?;

        let mut values = Vec::with_capacity(self.width);
        for method in self.methods.iter_mut() {
            let expected = method.fields().len();
            method.start_group(key);
            let result = method.compute(&data, deadline.as_ref())?;
            if result.len() != expected {
                return Err(GroupError::Data(format!(
                    "method returned {} values for {} fields",
                    result.len(),
                    expected
                )));
            }
            values.extend(result);
            if let Some(deadline) = &deadline {
                deadline.check()?;
            }
        }
        Ok(GroupResult {
            key: key.clone(),
            sample_count: data.sample_count(),
            variant_count: data.variant_count(),
            values,
            error: None,
        })
    }

    fn process(&mut self, key: GroupKey) -> GroupResult {
        match self.compute(&key) {
            Ok(result) => result,
            Err(e) => {
                debug!("Group {}: {}", key, e);
                GroupResult {
                    key,
                    sample_count: 0,
                    variant_count: 0,
                    values: vec![f64::NAN; self.width],
                    error: Some(e),
                }
            }
        }
    }
}

fn run_worker(
    index: usize,
    ctx: Arc<GroupContext>,
    barrier: &ReadyFlags,
    groups: Receiver<GroupKey>,
    results: Sender<GroupResult>,
    cancel: &AtomicBool,
) -> PipelineResult<usize> {
    let mut worker = match GroupWorker::open(ctx) {
        Ok(worker) => worker,
        Err(e) => {
            warn!("Group worker {} failed to start: {}", index, e);
            barrier.abort(&format!("group worker {} failed to start", index));
            return Err(e);
        }
    };
    barrier.signal_ready(index);
    barrier
        .wait_all()
        .map_err(|e| PipelineError::Aborted(e.to_string()))?;

    let mut processed = 0;
    for key in groups.iter() {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        if results.send(worker.process(key)).is_err() {
            break;
        }
        processed += 1;
    }
    debug!("Group worker {} processed {} groups", index, processed);
    Ok(processed)
}

/// Start `workers` group workers reading from `groups`
pub fn spawn_group_workers(
    ctx: Arc<GroupContext>,
    workers: usize,
    groups: Receiver<GroupKey>,
    results: Sender<GroupResult>,
    cancel: Arc<AtomicBool>,
) -> std::io::Result<Vec<JoinHandle<PipelineResult<usize>>>> {
    let barrier = Arc::new(ReadyFlags::new(workers));
    let mut handles = Vec::with_capacity(workers);
    for index in 0..workers {
        let ctx = ctx.clone();
        let flags = barrier.clone();
        let groups = groups.clone();
        let results = results.clone();
        let cancel = cancel.clone();
        let spawned = thread::Builder::new()
            .name(format!("group-{}", index))
            .spawn(move || run_worker(index, ctx, &flags, groups, results, &cancel));
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                // release the workers already waiting for their peers
                barrier.abort(&format!("cannot start group worker {}", index));
                return Err(e);
            }
        }
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAN: f64 = f64::NAN;

    #[test]
    fn test_thresholds() {
        let filter = MissingnessFilter::new(Some(0.0), None);
        assert_eq!(filter.discard_samples, 1e-8);
        assert_eq!(filter.discard_variants, 1.0);
        assert_eq!(MissingnessFilter::default(), MissingnessFilter::new(None, None));
    }

    #[test]
    fn test_incomplete_samples_are_dropped() {
        let matrix = vec![
            vec![0.0, 1.0],
            vec![1.0, 0.0],
            vec![2.0, 1.0],
            vec![0.0, 0.0],
            vec![2.0, 2.0],
            vec![1.0, NAN],
            vec![NAN, NAN],
        ];
        let phenotype = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let data = MissingnessFilter::new(Some(0.5), None).apply(&matrix, &phenotype).unwrap();
        // sample 5 is 50% missing, sample 6 fully missing
        assert_eq!(data.sample_count(), 5);
        assert_eq!(data.phenotype, vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        let kept = MissingnessFilter::default().apply(&matrix, &phenotype).unwrap();
        assert_eq!(kept.sample_count(), 6);
    }

    #[test]
    fn test_too_few_samples_fail_the_group() {
        let matrix = vec![vec![0.0], vec![1.0], vec![NAN], vec![2.0], vec![1.0]];
        let err = MissingnessFilter::default().apply(&matrix, &[0.0; 5]).unwrap_err();
        assert_eq!(err, GroupError::TooFewSamples(4));
    }

    #[test]
    fn test_monomorphic_and_missing_loci_are_dropped() {
        let matrix = vec![
            vec![1.0, 0.0, NAN],
            vec![1.0, 1.0, NAN],
            vec![1.0, 0.0, 1.0],
            vec![1.0, 2.0, 0.0],
            vec![1.0, 0.0, NAN],
        ];
        let data = MissingnessFilter::new(None, Some(0.5)).apply(&matrix, &[0.0; 5]).unwrap();
        assert_eq!(data.variant_count(), 1);
        assert_eq!(data.genotypes[3], vec![2.0]);

        let monomorphic = vec![vec![1.0]; 5];
        assert_eq!(
            MissingnessFilter::default().apply(&monomorphic, &[0.0; 5]).unwrap_err(),
            GroupError::NoVariants
        );
        assert_eq!(
            MissingnessFilter::default().apply(&[], &[]).unwrap_err(),
            GroupError::NoVariants
        );
    }

    #[test]
    fn test_failed_result_detection() {
        let mut result = GroupResult {
            key: GroupKey(Vec::new()),
            sample_count: 0,
            variant_count: 0,
            values: vec![NAN, NAN],
            error: None,
        };
        assert!(result.is_failed());
        result.values[1] = 0.5;
        assert!(!result.is_failed());
    }
}
