// ==============================================================================
// importer.rs - Variant and Genotype Import
// ==============================================================================
// Description: Import entry point; ordered records -> variant index -> writers
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Per file:
//   1. Skip known files unless forced (forced re-import drops old samples)
//   2. Read the header, checksum the file, discover sample names
//   3. Stream records in input order through the reader pool
//   4. Deduplicate against the variant index, insert or update variants
//   5. Buffer genotypes per sample and flush them in batches
// ==============================================================================

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::io::{BufRead, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::format::FormatSpec;
use crate::index::VariantIndex;
use crate::models::{GenotypeRow, ImportSummary, ParsedRecord, SampleId, VariantIdentity};
use crate::parser::{ColumnLayout, RecordParser};
use crate::project::Project;
use crate::reader_pool::{open_input, OrderedRecords};
use crate::store::{GenotypeStore, ProjectStore};
use crate::writer::BatchedWriter;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub files: Vec<PathBuf>,
    pub format: FormatSpec,
    /// Names that override those found in the header
    pub sample_names: Vec<String>,
    /// Re-import files that are already in the project
    pub force: bool,
    /// Reader threads per file, 0 parses on the importing thread
    pub jobs: usize,
}

/// What gets written for the samples of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenotypeStatus {
    /// Variants only
    NoSamples,
    /// One genotype row per called sample and variant
    Genotypes,
    /// Samples were named but the format has no genotype field; every
    /// variant is recorded for every sample
    NamesOnly,
}

/// Samples found in a file
#[derive(Debug, Clone, PartialEq)]
pub struct SampleProbe {
    pub names: Vec<Option<String>>,
    pub status: GenotypeStatus,
}

/// Header lines and the first data line of an input
#[derive(Debug, Clone, Default)]
pub struct FileHeader {
    pub lines: Vec<String>,
    pub first_data_line: Option<String>,
}

impl FileHeader {
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let mut reader = open_input(path)?;
        let mut header = FileHeader::default();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.starts_with('#') {
                header.lines.push(trimmed.to_string());
            } else if !trimmed.trim().is_empty() {
                header.first_data_line = Some(trimmed.to_string());
                break;
            }
        }
        Ok(header)
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Hex-encoded SHA-256 of a file's bytes
pub fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Work out sample names for the genotype columns of a file
///
/// Explicit names must match the number of genotype columns. Otherwise the
/// names come from the last header line, aligned from the right so headers
/// with fewer leading columns still line up. A single unnamed sample is
/// accepted; several are an error.
pub fn probe_samples(
    format: &FormatSpec,
    header: &FileHeader,
    explicit: &[String],
) -> Result<SampleProbe, ConfigError> {
    let Some(probe) = format.genotype_probe() else {
        let status = if explicit.is_empty() {
            GenotypeStatus::NoSamples
        } else {
            GenotypeStatus::NamesOnly
        };
        return Ok(SampleProbe {
            names: explicit.iter().cloned().map(Some).collect(),
            status,
        });
    };
    let Some(first_line) = header.first_data_line.as_deref() else {
        return Ok(SampleProbe {
            names: Vec::new(),
            status: GenotypeStatus::NoSamples,
        });
    };

    let mut parser = RecordParser::new(&probe)?;
    parser
        .prepare(first_line)
        .map_err(|e| ConfigError::Format(e.to_string()))?;
    let columns = parser.sample_columns().unwrap_or_default();
    let n_columns = parser.layout().map(|l| l.n_columns).unwrap_or_default();
    if columns.is_empty() {
        return Ok(SampleProbe {
            names: Vec::new(),
            status: GenotypeStatus::NoSamples,
        });
    }

    if !explicit.is_empty() {
        if explicit.len() != columns.len() {
            return Err(ConfigError::Format(format!(
                "{} sample names given for {} genotype columns",
                explicit.len(),
                columns.len()
            )));
        }
        return Ok(SampleProbe {
            names: explicit.iter().cloned().map(Some).collect(),
            status: GenotypeStatus::Genotypes,
        });
    }

    let from_header = header.lines.last().and_then(|line| {
        let fields: Vec<&str> = line
            .trim_start_matches('#')
            .split(format.delimiter.as_str())
            .map(str::trim)
            .collect();
        header_names(&fields, n_columns, &columns)
    });
    match from_header {
        Some(names) => Ok(SampleProbe {
            names: names.into_iter().map(Some).collect(),
            status: GenotypeStatus::Genotypes,
        }),
        None if columns.len() == 1 => Ok(SampleProbe {
            names: vec![None],
            status: GenotypeStatus::Genotypes,
        }),
        None => Err(ConfigError::Format(format!(
            "cannot determine names of {} samples from the header; pass them explicitly",
            columns.len()
        ))),
    }
}

fn header_names(fields: &[&str], n_columns: usize, columns: &[usize]) -> Option<Vec<String>> {
    let min = *columns.iter().min()?;
    let max = *columns.iter().max()?;
    if max - min >= fields.len() {
        return None;
    }
    let offset = fields.len() as isize - n_columns as isize;
    columns
        .iter()
        .map(|&c| {
            let idx = c as isize + offset;
            if idx < 0 {
                return None;
            }
            fields
                .get(idx as usize)
                .filter(|name| !name.is_empty())
                .map(|name| name.to_string())
        })
        .collect()
}

/// Output columns holding each sample's genotype and genotype info
#[derive(Debug, Clone)]
struct SampleColumns {
    genotype: (usize, usize),
    info: Vec<(usize, usize)>,
}

impl SampleColumns {
    fn from_layout(layout: &ColumnLayout, ranges: [usize; 5]) -> Option<Self> {
        let genotype = *layout.column_ranges.get(ranges[2])?;
        let info = (ranges[3]..ranges[4])
            .filter_map(|f| layout.column_ranges.get(f).copied())
            .collect();
        Some(Self { genotype, info })
    }

    /// Output column of sample `idx` within a field range; single-column
    /// fields are shared by every sample
    fn column(range: (usize, usize), idx: usize) -> usize {
        if range.1 - range.0 <= 1 {
            range.0
        } else {
            range.0 + idx
        }
    }

    fn row(&self, record: &ParsedRecord, idx: usize, variant_id: u64) -> Option<GenotypeRow> {
        let gt = record.fields.get(Self::column(self.genotype, idx)).cloned().flatten()?;
        let mut values = Vec::with_capacity(1 + self.info.len());
        values.push(Some(gt));
        for range in &self.info {
            values.push(record.fields.get(Self::column(*range, idx)).cloned().flatten());
        }
        Some(GenotypeRow { variant_id, values })
    }
}

pub struct Importer<'a> {
    project: &'a Project,
    options: ImportOptions,
    store: ProjectStore,
    index: VariantIndex,
}

impl<'a> Importer<'a> {
    pub fn new(project: &'a Project, options: ImportOptions) -> Result<Self> {
        options.format.validate()?;
        let mut store = project.store().context("Failed to open project database")?;
        store.ensure_variant_columns(&options.format.variant_info)?;
        let index = store.load_variant_index()?;
        info!("Variant index holds {} known variants", index.len());
        Ok(Self {
            project,
            options,
            store,
            index,
        })
    }

    pub fn run(mut self) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        let mut genotypes = self.project.genotypes().context("Failed to open genotype database")?;
        let files = self.options.files.clone();
        for path in &files {
            let (returned, file_summary) = self
                .import_file(path, genotypes)
                .with_context(|| format!("Failed to import {}", path.display()))?;
            genotypes = returned;
            summary.merge(&file_summary);
        }
        info!(
            "Imported {} files: {} records, {} skipped, {} new variants, {} genotypes",
            summary.files_imported,
            summary.records_processed,
            summary.records_skipped,
            summary.new_variants,
            summary.genotypes_written
        );
        Ok(summary)
    }

    fn import_file(&mut self, path: &Path, genotypes: GenotypeStore) -> Result<(GenotypeStore, ImportSummary)> {
        let mut summary = ImportSummary::default();
        let filename = path.to_string_lossy().to_string();
        if !path.exists() {
            bail!("Input file {} does not exist", filename);
        }

        if let Some(file_id) = self.store.find_file(&filename)? {
            if !self.options.force {
                warn!("{} is already imported, use force to re-import", filename);
                summary.files_ignored = 1;
                return Ok((genotypes, summary));
            }
            info!("Removing previous import of {}", filename);
            self.store.begin()?;
            for sample in self.store.remove_file(file_id)? {
                genotypes.drop_table(sample)?;
            }
            self.store.commit()?;
        }

        let header = FileHeader::read(path)?;
        let checksum = file_checksum(path)?;
        let probe = probe_samples(&self.options.format, &header, &self.options.sample_names)?;
        let format = match probe.status {
            GenotypeStatus::Genotypes => self.options.format.clone(),
            _ => self.options.format.without_genotypes(),
        };

        self.store.begin()?;
        let file_id = self.store.record_file(&filename, &header.text(), &checksum)?;
        let mut samples: Vec<SampleId> = Vec::with_capacity(probe.names.len());
        for name in &probe.names {
            let sample = self.store.add_sample(file_id, name.as_deref())?;
            genotypes.create_table(
                sample,
                probe.status == GenotypeStatus::Genotypes,
                &format.genotype_info,
            )?;
            samples.push(sample);
        }
        self.store.commit()?;
        summary.samples_created = samples.len();
        info!("Importing {} with {} samples", filename, samples.len());

        let parser = RecordParser::new(&format)?;
        let columns = match (&probe.status, header.first_data_line.as_deref()) {
            (GenotypeStatus::Genotypes, Some(line)) => {
                let mut layout_parser = parser.clone();
                layout_parser.prepare(line)?;
                layout_parser
                    .layout()
                    .and_then(|layout| SampleColumns::from_layout(layout, format.ranges()))
            }
            _ => None,
        };

        let settings = &self.project.settings;
        let mut writer = BatchedWriter::new(genotypes, settings.batch_size, settings.flushes_per_commit);
        let mut records = OrderedRecords::open(parser, path, self.options.jobs, settings.heap_factor)?;
        let n_info = format.variant_info.len();

        self.store.begin()?;
        for record in records.by_ref() {
            let record = record?;
            let identity = match (record.field(0), record.field(1).and_then(|p| p.parse::<u64>().ok())) {
                (Some(chr), Some(pos)) => VariantIdentity::new(
                    chr,
                    pos,
                    record.field(2).unwrap_or("-"),
                    record.field(3).unwrap_or("-"),
                ),
                _ => {
                    debug!("Line {}: missing chromosome or position", record.line_no);
                    summary.records_skipped += 1;
                    continue;
                }
            };
            let info: Vec<Option<String>> = record.fields[4..4 + n_info].to_vec();
            summary.count_kind(identity.kind());

            let variant_id = match self.index.lookup(&identity) {
                Some(entry) => {
                    if n_info > 0 {
                        self.index.update_attributes(entry.stored_id, info);
                        summary.updated_variants += 1;
                    }
                    entry.stored_id
                }
                None => {
                    let id = self.index.insert(identity.clone());
                    self.store.insert_variant(id, record.bin, &identity, &info)?;
                    summary.new_variants += 1;
                    id
                }
            };

            match probe.status {
                GenotypeStatus::Genotypes => {
                    if let Some(columns) = &columns {
                        for (idx, sample) in samples.iter().enumerate() {
                            if let Some(row) = columns.row(&record, idx, variant_id) {
                                writer.write(*sample, row)?;
                                summary.genotypes_written += 1;
                            }
                        }
                    }
                }
                GenotypeStatus::NamesOnly => {
                    for sample in &samples {
                        writer.write(
                            *sample,
                            GenotypeRow {
                                variant_id,
                                values: Vec::new(),
                            },
                        )?;
                        summary.genotypes_written += 1;
                    }
                }
                GenotypeStatus::NoSamples => {}
            }

            summary.records_processed += 1;
            if summary.records_processed % settings.commit_interval == 0 {
                self.flush_variant_updates()?;
                self.store.commit()?;
                self.store.begin()?;
                debug!("{}: {} records processed", filename, summary.records_processed);
            }
        }
        self.flush_variant_updates()?;
        self.store.commit()?;
        let genotypes = writer.close()?;

        let stats = records.stats();
        summary.lines_processed = stats.lines;
        summary.records_skipped += stats.skipped;
        summary.files_imported = 1;
        info!(
            "{}: {} records from {} lines, {} skipped, {} new variants",
            filename, summary.records_processed, stats.lines, summary.records_skipped, summary.new_variants
        );
        Ok((genotypes, summary))
    }

    fn flush_variant_updates(&mut self) -> Result<()> {
        for (id, info) in self.index.take_pending_updates() {
            self.store.update_variant_info(id, &info)?;
        }
        Ok(())
    }
}

/// Import entry point
pub fn import(project: &Project, options: ImportOptions) -> Result<ImportSummary> {
    Importer::new(project, options)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEADER: &str = "##fileformat=VCFv4.2\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\n";

    fn write_vcf(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    fn options(files: Vec<PathBuf>, force: bool, jobs: usize) -> ImportOptions {
        ImportOptions {
            files,
            format: FormatSpec::vcf(),
            sample_names: Vec::new(),
            force,
            jobs,
        }
    }

    const BODY: &str = "1\t100\t.\tA\tG\t.\t.\t.\tGT\t0/1\t1/1\n\
                        1\t200\t.\tAT\tA,ATT\t.\t.\t.\tGT\t1/2\t0/0\n\
                        1\t300\t.\tC\tT\t.\t.\t.\tGT\t./.\t0/1\n\
                        1\tbad\t.\tC\tT\t.\t.\t.\tGT\t0/1\t0/1\n";

    #[test]
    fn test_probe_samples_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vcf(dir.path(), "a.vcf", BODY);
        let header = FileHeader::read(&path).unwrap();
        let probe = probe_samples(&FormatSpec::vcf(), &header, &[]).unwrap();
        assert_eq!(probe.names, vec![Some("S1".to_string()), Some("S2".to_string())]);
        assert_eq!(probe.status, GenotypeStatus::Genotypes);

        let explicit = probe_samples(&FormatSpec::vcf(), &header, &["X".into(), "Y".into()]).unwrap();
        assert_eq!(explicit.names[1].as_deref(), Some("Y"));
        assert!(probe_samples(&FormatSpec::vcf(), &header, &["X".into()]).is_err());

        let names_only = probe_samples(&FormatSpec::vcf().without_genotypes(), &header, &["X".into()]).unwrap();
        assert_eq!(names_only.status, GenotypeStatus::NamesOnly);
    }

    #[test]
    fn test_probe_requires_names_for_many_samples() {
        let header = FileHeader {
            lines: vec!["##source=test".into()],
            first_data_line: Some("1\t100\t.\tA\tG\t.\t.\t.\tGT\t0/1\t1/1".into()),
        };
        assert!(probe_samples(&FormatSpec::vcf(), &header, &[]).is_err());

        let single = FileHeader {
            lines: Vec::new(),
            first_data_line: Some("1\t100\t.\tA\tG\t.\t.\t.\tGT\t0/1".into()),
        };
        assert_eq!(probe_samples(&FormatSpec::vcf(), &single, &[]).unwrap().names, vec![None]);
    }

    #[test]
    fn test_import_counts_and_genotypes() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::init(&dir.path().join("p"), "demo").unwrap();
        let path = write_vcf(dir.path(), "a.vcf", BODY);

        let summary = import(&project, options(vec![path], false, 2)).unwrap();
        assert_eq!(summary.files_imported, 1);
        assert_eq!(summary.samples_created, 2);
        // the multi-allelic line expands into two records
        assert_eq!(summary.records_processed, 4);
        assert_eq!(summary.records_skipped, 1);
        assert_eq!(summary.new_variants, 4);
        assert_eq!(summary.snv, 2);
        assert_eq!(summary.insertions + summary.deletions, 2);
        // S1: 1, -1, -1 (./. is not written); S2: 2, 0, 1
        assert_eq!(summary.genotypes_written, 6);

        let genotypes = project.genotypes().unwrap();
        let total: i64 = genotypes
            .connection()
            .query_row("SELECT count(*) FROM genotype_1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_reimport_is_ignored_unless_forced_and_ids_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::init(&dir.path().join("p"), "demo").unwrap();
        let path = write_vcf(dir.path(), "a.vcf", BODY);

        import(&project, options(vec![path.clone()], false, 0)).unwrap();
        let before = project.store().unwrap().load_variant_index().unwrap();
        let ignored = import(&project, options(vec![path.clone()], false, 0)).unwrap();
        assert_eq!(ignored.files_ignored, 1);

        let forced = import(&project, options(vec![path], true, 3)).unwrap();
        assert_eq!(forced.new_variants, 0);
        let store = project.store().unwrap();
        assert_eq!(store.variant_count().unwrap(), 4);
        let after = store.load_variant_index().unwrap();
        let identity = VariantIdentity::new("1", 100, "A", "G");
        assert_eq!(
            before.lookup(&identity).unwrap().stored_id,
            after.lookup(&identity).unwrap().stored_id
        );
        // old samples are gone, new ones were created
        assert_eq!(store.samples().unwrap().len(), 2);
    }

    #[test]
    fn test_checksum_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_checksum(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
