// ==============================================================================
// associate.rs - Association Runs
// ==============================================================================
// Description: Phenotype selection, group planning and pipeline orchestration
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Run stages:
//   1. select samples with a phenotype value and a genotype table
//   2. rebuild the group index, skip groups already in the result database
//   3. cache sample genotypes by group (loader pool)
//   4. compute groups (worker pool) while the maintenance thread indexes
//   5. aggregate results on the calling thread
// ==============================================================================

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, unbounded};
use rusqlite::types::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::{AggregateCounts, ResultAggregator, ResultDb, ResultPrinter};
use crate::error::PipelineError;
use crate::group_worker::{spawn_group_workers, GroupContext, MissingnessFilter, MIN_SAMPLES};
use crate::grouping::{build_group_index, distinct_groups, mark_ignored, validate_group_fields};
use crate::loader::{load_samples, LoadedSamples, LoaderConfig};
use crate::maintenance::{Maintenance, MaintenanceConfig};
use crate::methods::{parse_methods, result_fields};
use crate::models::{AssociationSummary, GroupKey, SampleId};
use crate::project::Project;
use crate::store::{check_identifier, column_types, genotype_table, table_columns, ProjectStore};

#[derive(Debug, Clone)]
pub struct AssociationOptions {
    /// Phenotype column of the sample table
    pub phenotype: String,
    /// Method specs such as `BurdenPermute --permutations 500`
    pub methods: Vec<String>,
    pub group_by: Vec<String>,
    pub jobs: usize,
    /// Missing-rate thresholds; 0 keeps only complete rows
    pub discard_samples: Option<f64>,
    pub discard_variants: Option<f64>,
    /// SQL conditions on genotype fields, e.g. `GT > 0`
    pub genotype_conditions: Vec<String>,
    /// Report path, `-` for stdout, no report when absent
    pub output: Option<PathBuf>,
    pub result_db: Option<PathBuf>,
    /// Recompute groups already present in the result database
    pub force: bool,
}

impl AssociationOptions {
    pub fn new(phenotype: &str, methods: Vec<String>, group_by: Vec<String>) -> Self {
        Self {
            phenotype: phenotype.to_string(),
            methods,
            group_by,
            jobs: 1,
            discard_samples: None,
            discard_variants: None,
            genotype_conditions: Vec::new(),
            output: Some(PathBuf::from("-")),
            result_db: None,
            force: false,
        }
    }
}

fn phenotype_value(value: Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(i as f64),
        Value::Real(f) => Some(f),
        Value::Text(s) => s.trim().parse().ok(),
        Value::Null | Value::Blob(_) => None,
    }
}

/// Samples with a phenotype value and genotype calls, in sample id order
///
/// A phenotype coded only with 1 and 2 is recoded to 0 and 1.
pub fn select_samples(project: &Project, store: &ProjectStore, phenotype: &str) -> Result<(Vec<SampleId>, Vec<f64>)> {
    check_identifier(phenotype)?;
    let conn = store.connection();
    let columns = table_columns(conn, "main", "sample")?;
    if !columns.iter().any(|c| c.eq_ignore_ascii_case(phenotype)) {
        bail!("Phenotype {} is not loaded; available fields: {}", phenotype, columns.join(", "));
    }

    let mut stmt = conn.prepare(&format!("SELECT sample_id, {} FROM sample ORDER BY sample_id", phenotype))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Value>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let genotypes = project.genotypes()?;
    let mut samples = Vec::with_capacity(rows.len());
    let mut values = Vec::with_capacity(rows.len());
    let mut missing = 0;
    let mut no_calls = 0;
    for (sample, value) in rows {
        let Some(value) = phenotype_value(value) else {
            missing += 1;
            continue;
        };
        let fields = table_columns(genotypes.connection(), "main", &genotype_table(sample))?;
        if !fields.iter().any(|f| f == "GT") {
            no_calls += 1;
            continue;
        }
        samples.push(sample);
        values.push(value);
    }
    if missing > 0 {
        warn!("{} samples with missing {} are excluded", missing, phenotype);
    }
    if no_calls > 0 {
        warn!("{} samples without genotype calls are excluded", no_calls);
    }
    if !values.is_empty() && values.iter().all(|v| *v == 1.0 || *v == 2.0) {
        info!("Recoding {} from 1/2 to 0/1", phenotype);
        values.iter_mut().for_each(|v| *v -= 1.0);
    }
    Ok((samples, values))
}

fn remove_shelves(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Test every group of variants for association with a phenotype
pub fn associate(project: &Project, options: &AssociationOptions) -> Result<AssociationSummary> {
    let settings = &project.settings;
    let methods = parse_methods(&options.methods)?;
    let fields = result_fields(&methods);
    let filter = MissingnessFilter::new(options.discard_samples, options.discard_variants);
    let mut summary = AssociationSummary {
        run_id: Uuid::new_v4().to_string(),
        ..Default::default()
    };

    let store = project.store()?;
    validate_group_fields(store.connection(), &options.group_by)?;
    let (samples, phenotype) = select_samples(project, &store, &options.phenotype)?;
    if samples.is_empty() {
        bail!("No sample has both genotypes and a value for {}", options.phenotype);
    }
    if samples.len() < MIN_SAMPLES {
        warn!("Only {} samples selected; every group will fail", samples.len());
    }
    summary.samples = samples.len();

    build_group_index(store.connection(), &options.group_by)?;
    let mut groups = distinct_groups(store.connection(), &options.group_by)?;
    summary.groups_total = groups.len();
    if let (Some(path), false) = (&options.result_db, options.force) {
        let computed = ResultDb::computed_groups(path, &options.group_by, &fields, settings.busy_timeout())?;
        if !computed.is_empty() {
            store.begin()?;
            for key in &computed {
                mark_ignored(store.connection(), &options.group_by, key)?;
            }
            store.commit()?;
            groups.retain(|g| !computed.contains(g));
            summary.groups_skipped = summary.groups_total - groups.len();
            info!("{} groups already computed", summary.groups_skipped);
        }
    }
    let group_types = column_types(store.connection(), "variant", &options.group_by)?;
    drop(store);
    if groups.is_empty() {
        info!("No group left to compute");
        return Ok(summary);
    }

    summary.workers = options.jobs.min(groups.len()).max(1);
    summary.loaders = settings.loader_count(summary.workers).min(samples.len());
    info!(
        "Testing {} groups of {} samples with {} loaders and {} workers",
        groups.len(),
        samples.len(),
        summary.loaders,
        summary.workers
    );

    project.clear_scratch()?;
    let loaded = load_samples(
        LoaderConfig {
            project_db: project.project_db(),
            genotype_db: project.genotype_db(),
            shelf_dir: project.scratch_dir(),
            group_by: options.group_by.clone(),
            conditions: options.genotype_conditions.clone(),
            busy_timeout: settings.busy_timeout(),
            busy_retries: settings.busy_retries,
        },
        summary.loaders,
        &samples,
    )
    .context("Failed to cache sample genotypes")?;

    let LoadedSamples { ownership, shelves } = loaded;
    let plan = GroupPlan {
        workers: summary.workers,
        fields,
        group_types,
        ctx: GroupContext {
            project_db: project.project_db(),
            group_by: options.group_by.clone(),
            samples,
            phenotype,
            ownership,
            shelves: shelves.clone(),
            methods,
            filter,
            treat_missing_as_wildtype: settings.treat_missing_as_wildtype,
            timeout: settings.association_timeout(),
            busy_timeout: settings.busy_timeout(),
        },
    };
    let result = compute_groups(project, options, plan, groups);
    if result.is_err() || !settings.keep_shelves {
        remove_shelves(&shelves);
    }
    let counts = result?;
    summary.succeeded = counts.succeeded;
    summary.failed = counts.failed;
    info!(
        "Association run {}: {} groups succeeded, {} failed",
        summary.run_id, summary.succeeded, summary.failed
    );
    Ok(summary)
}

struct GroupPlan {
    workers: usize,
    fields: Vec<String>,
    group_types: Vec<String>,
    ctx: GroupContext,
}

fn compute_groups(
    project: &Project,
    options: &AssociationOptions,
    plan: GroupPlan,
    groups: Vec<GroupKey>,
) -> Result<AggregateCounts> {
    let settings = &project.settings;
    let printer = options
        .output
        .as_deref()
        .map(|path| ResultPrinter::create(path, &options.group_by, &plan.fields))
        .transpose()?;
    let db = options
        .result_db
        .as_deref()
        .map(|path| {
            ResultDb::open(
                path,
                &options.group_by,
                &plan.group_types,
                &plan.fields,
                settings.busy_timeout(),
                settings.result_commit_interval(),
            )
        })
        .transpose()?;

    let maintenance = Maintenance::spawn(MaintenanceConfig {
        genotype_db: project.genotype_db(),
        samples: plan.ctx.samples.clone(),
        busy_timeout: settings.busy_timeout(),
        busy_retries: settings.busy_retries,
    })?;

    let expected = groups.len();
    let cancel = Arc::new(AtomicBool::new(false));
    let (group_tx, group_rx) = unbounded();
    let (result_tx, result_rx) = bounded(plan.workers * 4);
    let handles = spawn_group_workers(Arc::new(plan.ctx), plan.workers, group_rx, result_tx, cancel.clone())?;
    for key in groups {
        // receivers live until every worker exits
        let _ = group_tx.send(key);
    }
    drop(group_tx);

    let aggregated = ResultAggregator::new(printer, db).run(result_rx, expected);
    if aggregated.is_err() {
        cancel.store(true, Ordering::Relaxed);
    }

    let mut failure: Option<PipelineError> = None;
    for (index, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(_)) => {}
            // a worker that saw the barrier abort only echoes another failure
            Ok(Err(PipelineError::Aborted(reason))) => {
                failure.get_or_insert(PipelineError::Aborted(reason));
            }
            Ok(Err(e)) => {
                if matches!(failure, None | Some(PipelineError::Aborted(_))) {
                    failure = Some(e);
                }
            }
            Err(_) => failure = Some(PipelineError::WorkerPanicked(format!("group-{}", index))),
        }
    }
    let indexed = maintenance.stop();
    if indexed > 0 {
        info!("Indexed genotypes of {} samples", indexed);
    }

    if let Some(e) = failure {
        return Err(e).context("Group workers failed");
    }
    aggregated.context("Failed to record results")
}
