// ==============================================================================
// parser.rs - Record Parser
// ==============================================================================
// Description: Turns raw delimited lines into normalized variant records
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use tracing::debug;

use crate::binning::normalize_variant;
use crate::error::{ConfigError, RecordError};
use crate::format::transform::{FieldValue, TransformChain, TransformError};
use crate::format::{ColumnRef, FormatSpec, IndexExpr, ResolvedIndex};
use crate::models::ParsedRecord;

/// Field declaration with its resolved transform chain
#[derive(Debug, Clone)]
struct RawField {
    name: String,
    expr: IndexExpr,
    chain: TransformChain,
}

/// One output column: where its input comes from and which field transforms it
#[derive(Debug, Clone)]
struct ColumnPlan {
    source: ColumnRef,
    field: usize,
}

/// Column layout fixed by the first data line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    /// Number of raw columns every line must have
    pub n_columns: usize,
    /// Output column range `[start, end)` of each descriptor field
    pub column_ranges: Vec<(usize, usize)>,
    /// Number of samples implied by per-sample fields, if any
    pub num_samples: Option<usize>,
}

/// Parser for one input format
///
/// Each reader worker owns its own parser; the `*FromFormat` transforms keep
/// lookup caches that must not be shared between threads.
#[derive(Debug, Clone)]
pub struct RecordParser {
    delimiter: String,
    fields: Vec<RawField>,
    /// Whether the first four output columns are chr, pos, ref, alt
    normalize: bool,
    plans: Vec<ColumnPlan>,
    layout: Option<ColumnLayout>,
}

impl RecordParser {
    pub fn new(format: &FormatSpec) -> Result<Self, ConfigError> {
        let mut fields = Vec::new();
        for field in format.fields() {
            let chain = TransformChain::resolve(&field.adj).map_err(|reason| {
                ConfigError::Format(format!("field '{}': {}", field.name, reason))
            })?;
            fields.push(RawField {
                name: field.name.clone(),
                expr: IndexExpr::parse(&field.index)?,
                chain,
            });
        }
        Ok(Self {
            delimiter: format.delimiter.clone(),
            fields,
            normalize: format.variant.len() == 4,
            plans: Vec::new(),
            layout: None,
        })
    }

    /// Layout established by the first processed line
    pub fn layout(&self) -> Option<&ColumnLayout> {
        self.layout.as_ref()
    }

    /// Forget the layout so a file with a different column count can follow
    pub fn reset(&mut self) {
        self.plans.clear();
        self.layout = None;
    }

    /// Source column of each sample of the first field (the moving column of
    /// a mixed index). Used to match genotype columns with header names.
    pub fn sample_columns(&self) -> Option<Vec<usize>> {
        self.layout.as_ref()?;
        let moving = self.fields.first()?.expr.moving_part();
        let cols = self
            .plans
            .iter()
            .filter(|p| p.field == 0)
            .map(|p| match &p.source {
                ColumnRef::Single(c) => *c,
                ColumnRef::Tuple(cs) => match moving {
                    Some(m) if m < cs.len() => cs[m],
                    _ => cs[cs.len() - 1],
                },
            })
            .collect();
        Some(cols)
    }

    fn establish_layout(&mut self, n_columns: usize) -> Result<(), RecordError> {
        let mut plans = Vec::new();
        let mut column_ranges = Vec::with_capacity(self.fields.len());
        let mut num_samples: Option<usize> = None;
        for (idx, field) in self.fields.iter().enumerate() {
            let start = plans.len();
            match field.expr.resolve(n_columns) {
                ResolvedIndex::Fixed(source) => plans.push(ColumnPlan { source, field: idx }),
                ResolvedIndex::PerSample(sources) => {
                    match num_samples {
                        None => num_samples = Some(sources.len()),
                        Some(n) if n != sources.len() => {
                            return Err(RecordError::Layout(format!(
                                "field '{}' spans {} samples but an earlier field spans {}; check the delimiter",
                                field.name,
                                sources.len(),
                                n
                            )));
                        }
                        Some(_) => {}
                    }
                    plans.extend(sources.into_iter().map(|source| ColumnPlan { source, field: idx }));
                }
            }
            column_ranges.push((start, plans.len()));
        }
        self.plans = plans;
        self.layout = Some(ColumnLayout {
            n_columns,
            column_ranges,
            num_samples,
        });
        Ok(())
    }

    /// Fix the column layout from a data line without parsing its values
    pub fn prepare(&mut self, line: &str) -> Result<(), RecordError> {
        if self.layout.is_none() {
            let line = line.trim_end_matches(['\n', '\r']);
            self.establish_layout(line.split(self.delimiter.as_str()).count())?;
        }
        Ok(())
    }

    /// Parse one line into zero or more records
    ///
    /// Returns an empty vector for lines that a `DiscardRecord` transform
    /// dropped. Record-level errors leave the parser usable for later lines.
    pub fn process(&mut self, line: &str, line_no: u64) -> Result<Vec<ParsedRecord>, RecordError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let tokens: Vec<&str> = line.split(self.delimiter.as_str()).map(str::trim).collect();

        if self.layout.is_none() {
            self.establish_layout(tokens.len())?;
        }
        let expected = self.layout.as_ref().map(|l| l.n_columns).unwrap_or_default();
        if tokens.len() != expected {
            return Err(RecordError::ColumnCount {
                line: line_no,
                expected,
                found: tokens.len(),
            });
        }

        let mut values = Vec::with_capacity(self.plans.len());
        for plan in &self.plans {
            let input = match &plan.source {
                ColumnRef::Single(c) => FieldValue::Text(column(&tokens, *c, line_no)?.to_string()),
                ColumnRef::Tuple(cs) => FieldValue::Columns(
                    cs.iter()
                        .map(|c| column(&tokens, *c, line_no).map(str::to_string))
                        .collect::<Result<Vec<_>, _>>()?,
                ),
            };
            let field = &mut self.fields[plan.field];
            let value = if field.chain.is_empty() {
                input
            } else {
                match field.chain.apply(input) {
                    Ok(v) => v,
                    Err(TransformError::Discard) => return Ok(Vec::new()),
                    Err(TransformError::Failed(reason)) => {
                        debug!("Line {}: failed to process field {}: {}", line_no, field.name, reason);
                        FieldValue::Missing
                    }
                }
            };
            values.push(value);
        }

        let num_records = values.iter().map(FieldValue::width).max().unwrap_or(1).max(1);
        let mut records = Vec::with_capacity(num_records);
        for i in 0..num_records {
            let mut fields: Vec<Option<String>> = values.iter().map(|v| v.expand(i)).collect();
            let mut bin = None;
            if self.normalize && fields.len() >= 4 {
                let pos = match fields[1].as_deref() {
                    Some(p) => Some(p.parse::<u64>().map_err(|_| RecordError::InvalidPosition {
                        line: line_no,
                        value: p.to_string(),
                    })?),
                    None => None,
                };
                let ref_allele = fields[2].clone().unwrap_or_default();
                let alt_allele = fields[3].clone().unwrap_or_default();
                if let Some(bad) = [&ref_allele, &alt_allele].into_iter().find(|a| !a.is_ascii()) {
                    return Err(RecordError::InvalidAllele {
                        line: line_no,
                        value: bad.clone(),
                    });
                }
                let normalized = normalize_variant(pos.unwrap_or_default(), &ref_allele, &alt_allele);
                if pos.is_some() {
                    bin = Some(normalized.bin);
                    fields[1] = Some(normalized.pos.to_string());
                }
                fields[2] = Some(normalized.ref_allele);
                fields[3] = Some(normalized.alt_allele);
            }
            records.push(ParsedRecord {
                line_no,
                sub_index: i as u32,
                bin,
                fields,
            });
        }
        Ok(records)
    }
}

fn column<'a>(tokens: &[&'a str], idx: usize, line_no: u64) -> Result<&'a str, RecordError> {
    tokens.get(idx).copied().ok_or(RecordError::ColumnOutOfRange {
        line: line_no,
        column: idx + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::transform::TransformSpec;
    use crate::format::{FieldSpec, FieldType};

    const VCF_LINE: &str = "chr1\t100\trs1\tA\tG,T\t50\tPASS\tDP=10\tGT:DP\t0/1:3\t1/2:5\t0/0:7";

    fn vcf_parser() -> RecordParser {
        RecordParser::new(&FormatSpec::vcf()).unwrap()
    }

    #[test]
    fn test_multi_allelic_line_expands_with_genotypes() {
        let mut parser = vcf_parser();
        let records = parser.process(VCF_LINE, 1).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.fields[0].as_deref(), Some("1"));
        assert_eq!(first.fields[1].as_deref(), Some("100"));
        assert_eq!(first.fields[3].as_deref(), Some("G"));
        // samples: 0/1 -> 1, 1/2 -> -1, 0/0 -> default 0
        assert_eq!(first.fields[4].as_deref(), Some("1"));
        assert_eq!(first.fields[5].as_deref(), Some("-1"));
        assert_eq!(first.fields[6].as_deref(), Some("0"));

        let second = &records[1];
        assert_eq!(second.sub_index, 1);
        assert_eq!(second.fields[3].as_deref(), Some("T"));
        // single-valued genotype codes pad with missing in later records
        assert_eq!(second.fields[4], None);
        assert_eq!(second.fields[5].as_deref(), Some("-1"));
        assert_eq!(second.fields[6], None);

        let layout = parser.layout().unwrap();
        assert_eq!(layout.num_samples, Some(3));
        assert_eq!(layout.column_ranges, vec![(0, 1), (1, 2), (2, 3), (3, 4), (4, 7)]);
        assert_eq!(parser.sample_columns(), Some(vec![9, 10, 11]));
    }

    #[test]
    fn test_indel_is_normalized_per_expansion() {
        let mut parser = vcf_parser();
        let line = "1\t100\t.\tAT\tA,ATT\t.\t.\t.\tGT\t1/2";
        let records = parser.process(line, 7).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fields[1].as_deref(), Some("101"));
        assert_eq!(records[0].fields[2].as_deref(), Some("T"));
        assert_eq!(records[0].fields[3].as_deref(), Some("-"));
        assert_eq!(records[1].fields[2].as_deref(), Some("-"));
        assert_eq!(records[1].fields[3].as_deref(), Some("T"));
        assert_eq!(records[0].bin, Some(crate::binning::max_ucsc_bin(100, 101)));
    }

    #[test]
    fn test_column_count_mismatch_is_recoverable() {
        let mut parser = vcf_parser();
        parser.process(VCF_LINE, 1).unwrap();
        let err = parser.process("1\t200\t.\tA\tC", 2).unwrap_err();
        assert_eq!(
            err,
            RecordError::ColumnCount {
                line: 2,
                expected: 12,
                found: 5
            }
        );
        assert!(!err.is_fatal());
        assert_eq!(parser.process(VCF_LINE, 3).unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_position_rejects_line() {
        let mut parser = vcf_parser();
        let line = VCF_LINE.replace("\t100\t", "\tabc\t");
        assert!(matches!(parser.process(&line, 4), Err(RecordError::InvalidPosition { .. })));
    }

    #[test]
    fn test_non_ascii_allele_rejects_line() {
        let mut parser = vcf_parser();
        let err = parser.process("1\t100\t.\té\tê\t.\t.\t.\tGT\t0/1", 2).unwrap_err();
        assert_eq!(
            err,
            RecordError::InvalidAllele {
                line: 2,
                value: "é".to_string()
            }
        );
        assert!(!err.is_fatal());
        assert_eq!(parser.process("1\t300\t.\tA\tG\t.\t.\t.\tGT\t0/1", 3).unwrap().len(), 1);
    }

    #[test]
    fn test_inconsistent_sample_fields_are_fatal() {
        let mut format = FormatSpec::vcf();
        format.genotype[0] = FieldSpec::new("GT", "10:", FieldType::Integer)
            .with_adj(vec![TransformSpec::VcfGenotype { default: None }]);
        format.genotype_info.push(FieldSpec::new("DP", "10::2", FieldType::Integer));
        let mut parser = RecordParser::new(&format).unwrap();
        let err = parser.process(VCF_LINE, 1).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_discarded_line_yields_nothing() {
        let mut format = FormatSpec::vcf().without_genotypes();
        format.variant_info.push(
            FieldSpec::new("filter", "7", FieldType::Text).with_adj(vec![TransformSpec::DiscardRecord {
                val: crate::format::transform::Matcher::One("PASS".into()),
            }]),
        );
        let mut parser = RecordParser::new(&format).unwrap();
        assert!(parser.process(VCF_LINE, 1).unwrap().is_empty());
    }

    #[test]
    fn test_failed_transform_gives_missing_value() {
        let mut format = FormatSpec::vcf().without_genotypes();
        format.variant_info.push(
            FieldSpec::new("dp", "8", FieldType::Integer)
                .with_adj(vec![TransformSpec::EncodeGenotype { default: None }]),
        );
        let mut parser = RecordParser::new(&format).unwrap();
        let records = parser.process(VCF_LINE, 1).unwrap();
        assert_eq!(records[0].fields[4], None);
    }
}
