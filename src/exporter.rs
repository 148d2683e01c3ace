// ==============================================================================
// exporter.rs - Variant and Genotype Export
// ==============================================================================
// Description: Writes variants with per-sample genotype columns
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// SQLite joins at most 64 tables, so samples are exported in blocks of at
// most 62 genotype tables (plus variant) per query. Each block runs on its
// own reader thread and rows are stitched back together by variant id.
// ==============================================================================

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::types::Value;
use std::io::Write;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{ExportSummary, SampleId, VariantId};
use crate::project::Project;
use crate::store::{genotype_table, open_read_only, table_columns, SampleRecord};

pub const MAX_SAMPLES_PER_QUERY: usize = 62;

const ROWS_PER_MESSAGE: usize = 512;
const MISSING: &str = ".";

#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Output path, gzip-compressed when it ends in `.gz`
    pub output: PathBuf,
    /// Sample names to export, all samples when empty
    pub samples: Vec<String>,
    pub delimiter: u8,
    pub header: bool,
    /// Genotype tables joined per query, capped at 62
    pub block_size: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            output: PathBuf::from("export.tsv"),
            samples: Vec::new(),
            delimiter: b'\t',
            header: true,
            block_size: MAX_SAMPLES_PER_QUERY,
        }
    }
}

type BlockRow = (VariantId, Vec<Option<String>>);
type BlockMessage = PipelineResult<Vec<BlockRow>>;

fn render(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(f.to_string()),
        Value::Text(s) => Some(s),
        Value::Blob(b) => Some(String::from_utf8_lossy(&b).into_owned()),
    }
}

pub(crate) fn open_output(path: &Path) -> std::io::Result<Box<dyn Write>> {
    let file = std::fs::File::create(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Ok(Box::new(GzEncoder::new(file, Compression::default())))
    } else {
        Ok(Box::new(std::io::BufWriter::new(file)))
    }
}

/// Query one block of samples, sending rows ordered by variant id
fn block_reader(
    project_db: PathBuf,
    genotype_db: PathBuf,
    samples: Vec<(SampleId, bool)>,
    busy_timeout: std::time::Duration,
    tx: Sender<BlockMessage>,
) {
    let run = || -> PipelineResult<()> {
        let conn = open_read_only(&genotype_db, busy_timeout)?;
        conn.execute("ATTACH DATABASE ?1 AS proj", [project_db.to_string_lossy()])?;

        let mut select = vec!["v.variant_id".to_string()];
        let mut joins = String::new();
        for (i, (sample, has_gt)) in samples.iter().enumerate() {
            select.push(if *has_gt {
                format!("g{}.GT", i)
            } else {
                format!("CASE WHEN g{0}.variant_id IS NULL THEN NULL ELSE 1 END", i)
            });
            joins.push_str(&format!(
                " LEFT OUTER JOIN {1} g{0} ON g{0}.variant_id = v.variant_id",
                i,
                genotype_table(*sample)
            ));
        }
        let sql = format!(
            "SELECT {} FROM proj.variant v{} ORDER BY v.variant_id",
            select.join(", "),
            joins
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut chunk = Vec::with_capacity(ROWS_PER_MESSAGE);
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let mut values = Vec::with_capacity(samples.len());
            for i in 0..samples.len() {
                values.push(render(row.get::<_, Value>(i + 1)?));
            }
            chunk.push((id as VariantId, values));
            if chunk.len() == ROWS_PER_MESSAGE && tx.send(Ok(std::mem::take(&mut chunk))).is_err() {
                return Ok(());
            }
        }
        if !chunk.is_empty() {
            let _ = tx.send(Ok(chunk));
        }
        Ok(())
    };
    if let Err(e) = run() {
        let _ = tx.send(Err(e));
    }
}

/// Row stream of one block with one row of lookahead
struct BlockStream {
    rx: Receiver<BlockMessage>,
    rows: Peekable<std::vec::IntoIter<BlockRow>>,
    width: usize,
}

impl BlockStream {
    fn peek_id(&mut self) -> PipelineResult<Option<VariantId>> {
        loop {
            if let Some((id, _)) = self.rows.peek() {
                return Ok(Some(*id));
            }
            match self.rx.recv() {
                Ok(Ok(rows)) => self.rows = rows.into_iter().peekable(),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(None),
            }
        }
    }

    /// Genotypes of `variant`; rows for earlier ids and duplicates are dropped
    fn take(&mut self, variant: VariantId) -> PipelineResult<Vec<Option<String>>> {
        while let Some(id) = self.peek_id()? {
            if id < variant {
                self.rows.next();
                continue;
            }
            if id == variant {
                if let Some((_, values)) = self.rows.next() {
                    return Ok(values);
                }
            }
            break;
        }
        Ok(vec![None; self.width])
    }
}

fn select_samples(all: Vec<SampleRecord>, wanted: &[String]) -> Vec<SampleRecord> {
    if wanted.is_empty() {
        return all;
    }
    let selected: Vec<SampleRecord> = all
        .into_iter()
        .filter(|s| s.name.as_ref().map(|n| wanted.contains(n)).unwrap_or(false))
        .collect();
    for name in wanted {
        if !selected.iter().any(|s| s.name.as_deref() == Some(name.as_str())) {
            warn!("Sample {} not found in project", name);
        }
    }
    selected
}

/// Export entry point
pub fn export(project: &Project, options: &ExportOptions) -> Result<ExportSummary> {
    let store = project.store().context("Failed to open project database")?;
    let genotypes = open_read_only(&project.genotype_db(), project.settings.busy_timeout())
        .context("Failed to open genotype database")?;

    let samples = select_samples(store.samples()?, &options.samples);
    let mut exportable: Vec<(SampleRecord, bool)> = Vec::with_capacity(samples.len());
    for sample in samples {
        let columns = table_columns(&genotypes, "main", &genotype_table(sample.sample_id))?;
        if columns.is_empty() {
            warn!("Sample {} has no genotype table", sample.sample_id);
            continue;
        }
        let has_gt = columns.iter().any(|c| c.eq_ignore_ascii_case("GT"));
        exportable.push((sample, has_gt));
    }
    drop(genotypes);

    let variant_columns = table_columns(store.connection(), "main", "variant")?;
    let value_columns: Vec<String> = variant_columns.into_iter().filter(|c| c != "variant_id" && c != "bin").collect();

    let block_size = options.block_size.clamp(1, MAX_SAMPLES_PER_QUERY);
    let mut streams = Vec::new();
    let mut handles = Vec::new();
    for (i, block) in exportable.chunks(block_size).enumerate() {
        let (tx, rx) = bounded(4);
        let ids: Vec<(SampleId, bool)> = block.iter().map(|(s, gt)| (s.sample_id, *gt)).collect();
        let width = ids.len();
        let project_db = project.project_db();
        let genotype_db = project.genotype_db();
        let busy_timeout = project.settings.busy_timeout();
        handles.push(
            thread::Builder::new()
                .name(format!("export-{}", i))
                .spawn(move || block_reader(project_db, genotype_db, ids, busy_timeout, tx))?,
        );
        streams.push(BlockStream {
            rx,
            rows: Vec::new().into_iter().peekable(),
            width,
        });
    }
    debug!("Exporting {} samples with {} reader threads", exportable.len(), streams.len());

    let mut writer = csv::WriterBuilder::new()
        .delimiter(options.delimiter)
        .has_headers(false)
        .from_writer(open_output(&options.output)?);
    if options.header {
        let mut header: Vec<String> = value_columns.clone();
        header.extend(exportable.iter().map(|(s, _)| {
            s.name.clone().unwrap_or_else(|| format!("sample_{}", s.sample_id))
        }));
        writer.write_record(&header)?;
    }

    let mut summary = ExportSummary {
        samples: exportable.len(),
        reader_threads: streams.len(),
        ..Default::default()
    };
    let mut stmt = store.connection().prepare(&format!(
        "SELECT variant_id, {} FROM variant ORDER BY variant_id",
        value_columns.join(", ")
    ))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let mut record: Vec<String> = Vec::with_capacity(value_columns.len() + exportable.len());
        for i in 0..value_columns.len() {
            record.push(render(row.get::<_, Value>(i + 1)?).unwrap_or_else(|| MISSING.to_string()));
        }
        for stream in streams.iter_mut() {
            let values = stream.take(id as VariantId)?;
            record.extend(values.into_iter().map(|v| v.unwrap_or_else(|| MISSING.to_string())));
        }
        writer.write_record(&record)?;
        summary.variants_exported += 1;
    }
    writer.flush()?;
    let inner = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to finish {}: {}", options.output.display(), e))?;
    drop(inner);

    // release the receivers so blocked readers exit before joining
    drop(streams);
    for handle in handles {
        handle
            .join()
            .map_err(|_| PipelineError::WorkerPanicked("export".to_string()))?;
    }

    info!(
        "Exported {} variants and {} samples to {}",
        summary.variants_exported,
        summary.samples,
        options.output.display()
    );
    Ok(summary)
}
