// ==============================================================================
// format/mod.rs - Input Format Descriptors
// ==============================================================================
// Description: Field-mapping descriptors, index expressions and column layouts
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// A descriptor lists fields in four ranges:
//   variant        chr, pos, ref, alt (exactly four, in that order)
//   variant_info   extra columns of the variant table
//   genotype       zero or one genotype field (usually a slice over samples)
//   genotype_info  per-sample values stored next to the genotype
//
// Index expressions are 1-based:
//   "5"       one column
//   "8,10"    both columns handed to the transforms as a tuple
//   "10:"     one output column per input column from 10 to the end
//   "9,10:"   column 9 paired with each of columns 10.. (one pair per sample)
//   "10::2"   every other column from 10
// ==============================================================================

pub mod transform;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::store::check_identifier;
use transform::TransformSpec;

/// SQL storage type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "float")]
    Real,
    #[default]
    Text,
}

impl FieldType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Integer => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::Text => "TEXT",
        }
    }
}

/// One field of a format descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub index: String,
    #[serde(default)]
    pub adj: Vec<TransformSpec>,
    #[serde(default, rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl FieldSpec {
    pub fn new(name: &str, index: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            index: index.to_string(),
            adj: Vec::new(),
            field_type,
            comment: None,
        }
    }

    pub fn with_adj(mut self, adj: Vec<TransformSpec>) -> Self {
        self.adj = adj;
        self
    }
}

fn default_delimiter() -> String {
    "\t".to_string()
}

/// Complete field-mapping descriptor of an input format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatSpec {
    pub name: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    pub variant: Vec<FieldSpec>,
    #[serde(default)]
    pub variant_info: Vec<FieldSpec>,
    #[serde(default)]
    pub genotype: Vec<FieldSpec>,
    #[serde(default)]
    pub genotype_info: Vec<FieldSpec>,
}

impl FormatSpec {
    /// Load a descriptor from a JSON file, or `vcf` for the built-in one
    pub fn load(name_or_path: &str) -> Result<Self, ConfigError> {
        if name_or_path.eq_ignore_ascii_case("vcf") && !Path::new(name_or_path).exists() {
            return Ok(Self::vcf());
        }
        let text = std::fs::read_to_string(name_or_path)?;
        let spec: FormatSpec = serde_json::from_str(&text)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Built-in VCF descriptor: genotypes from the FORMAT/sample column pairs
    pub fn vcf() -> Self {
        Self {
            name: "vcf".to_string(),
            delimiter: default_delimiter(),
            variant: vec![
                FieldSpec::new("chr", "1", FieldType::Text)
                    .with_adj(vec![TransformSpec::RemoveLeading { val: "chr".to_string() }]),
                FieldSpec::new("pos", "2", FieldType::Integer),
                FieldSpec::new("ref", "4", FieldType::Text),
                FieldSpec::new("alt", "5", FieldType::Text)
                    .with_adj(vec![TransformSpec::CheckSplit { sep: ",".to_string() }]),
            ],
            variant_info: Vec::new(),
            genotype: vec![FieldSpec::new("GT", "9,10:", FieldType::Integer).with_adj(vec![
                TransformSpec::VcfGenoFromFormat {
                    default: Some("0".to_string()),
                },
            ])],
            genotype_info: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.variant.len() != 4 {
            return Err(ConfigError::Format(format!(
                "{}: exactly four variant fields (chr, pos, ref, alt) are required, found {}",
                self.name,
                self.variant.len()
            )));
        }
        if self.genotype.len() > 1 {
            return Err(ConfigError::Format(format!(
                "{}: at most one genotype field is allowed",
                self.name
            )));
        }
        if self.genotype.is_empty() && !self.genotype_info.is_empty() {
            return Err(ConfigError::Format(format!(
                "{}: genotype info fields require a genotype field",
                self.name
            )));
        }
        if self.delimiter.is_empty() {
            return Err(ConfigError::Format(format!("{}: empty delimiter", self.name)));
        }
        for field in self.fields() {
            check_identifier(&field.name)?;
            IndexExpr::parse(&field.index)?;
        }
        for field in self.variant.iter().chain(self.variant_info.iter()) {
            if field.index.contains(':') {
                return Err(ConfigError::Format(format!(
                    "{}: variant field '{}' cannot use a column slice",
                    self.name, field.name
                )));
            }
        }
        Ok(())
    }

    /// All fields in range order
    pub fn fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.variant
            .iter()
            .chain(self.variant_info.iter())
            .chain(self.genotype.iter())
            .chain(self.genotype_info.iter())
    }

    /// Field index boundaries of the four ranges
    pub fn ranges(&self) -> [usize; 5] {
        let a = self.variant.len();
        let b = a + self.variant_info.len();
        let c = b + self.genotype.len();
        let d = c + self.genotype_info.len();
        [0, a, b, c, d]
    }

    /// Descriptor without genotype fields, for files imported as variants only
    pub fn without_genotypes(&self) -> Self {
        Self {
            genotype: Vec::new(),
            genotype_info: Vec::new(),
            ..self.clone()
        }
    }

    /// Descriptor holding only the genotype field, used to probe sample columns
    pub fn genotype_probe(&self) -> Option<Self> {
        let genotype = self.genotype.first()?.clone();
        Some(Self {
            name: format!("{}-probe", self.name),
            delimiter: self.delimiter.clone(),
            variant: Vec::new(),
            variant_info: Vec::new(),
            genotype: vec![genotype],
            genotype_info: Vec::new(),
        })
    }

    pub fn has_genotype(&self) -> bool {
        !self.genotype.is_empty()
    }
}

/// One comma-separated part of an index expression (0-based internally)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexPart {
    Column(usize),
    Slice {
        start: Option<i64>,
        end: Option<i64>,
        step: usize,
    },
}

/// Parsed index expression of a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexExpr {
    pub parts: Vec<IndexPart>,
}

/// Source columns feeding one output column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    Single(usize),
    Tuple(Vec<usize>),
}

/// Result of resolving an index expression against a column count
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedIndex {
    /// Exactly one output column
    Fixed(ColumnRef),
    /// One output column per sample
    PerSample(Vec<ColumnRef>),
}

fn parse_int(expr: &str, s: &str) -> Result<i64, ConfigError> {
    s.trim().parse::<i64>().map_err(|_| ConfigError::IndexExpression {
        expr: expr.to_string(),
        reason: format!("'{}' is not an integer", s),
    })
}

/// Column indices selected by a slice, with negative bounds counted from
/// the end and out-of-range bounds clamped
fn slice_indices(len: usize, start: Option<i64>, end: Option<i64>, step: usize) -> Vec<usize> {
    let clamp = |v: i64| -> usize {
        let v = if v < 0 { v + len as i64 } else { v };
        v.clamp(0, len as i64) as usize
    };
    let start = start.map(clamp).unwrap_or(0);
    let end = end.map(clamp).unwrap_or(len);
    (start..end).step_by(step).collect()
}

impl IndexExpr {
    pub fn parse(expr: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::IndexExpression {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };
        let mut parts = Vec::new();
        for part in expr.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(invalid("empty column index"));
            }
            if part.contains(':') {
                let pieces: Vec<&str> = part.split(':').map(str::trim).collect();
                if pieces.len() > 3 {
                    return Err(invalid("too many ':' in slice"));
                }
                let start = match pieces[0] {
                    "" => None,
                    s => Some(parse_int(expr, s)? - 1),
                };
                let end = match pieces[1] {
                    "" => None,
                    s => {
                        let e = parse_int(expr, s)?;
                        // positive ends are 1-based, negative ends count from the back
                        Some(if e >= 0 { e - 1 } else { e })
                    }
                };
                let step = match pieces.get(2) {
                    None | Some(&"") => 1,
                    Some(s) => {
                        let step = parse_int(expr, s)?;
                        if step <= 0 {
                            return Err(invalid("slice step must be positive"));
                        }
                        step as usize
                    }
                };
                parts.push(IndexPart::Slice { start, end, step });
            } else {
                let col = parse_int(expr, part)?;
                if col < 1 {
                    return Err(invalid("column indexes are 1-based"));
                }
                parts.push(IndexPart::Column(col as usize - 1));
            }
        }
        let slices = parts.iter().filter(|p| matches!(p, IndexPart::Slice { .. })).count();
        if slices > 1 {
            return Err(invalid("at most one slice is allowed"));
        }
        Ok(Self { parts })
    }

    pub fn has_slice(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, IndexPart::Slice { .. }))
    }

    /// Position of the slice among the parts (the column that moves per sample)
    pub fn moving_part(&self) -> Option<usize> {
        self.parts.iter().position(|p| matches!(p, IndexPart::Slice { .. }))
    }

    /// Resolve against the number of columns of the first data line
    pub fn resolve(&self, n_columns: usize) -> ResolvedIndex {
        if !self.has_slice() {
            let cols: Vec<usize> = self
                .parts
                .iter()
                .filter_map(|p| match p {
                    IndexPart::Column(c) => Some(*c),
                    IndexPart::Slice { .. } => None,
                })
                .collect();
            return if cols.len() == 1 {
                ResolvedIndex::Fixed(ColumnRef::Single(cols[0]))
            } else {
                ResolvedIndex::Fixed(ColumnRef::Tuple(cols))
            };
        }
        if self.parts.len() == 1 {
            if let IndexPart::Slice { start, end, step } = &self.parts[0] {
                let cols = slice_indices(n_columns, *start, *end, *step);
                return ResolvedIndex::PerSample(cols.into_iter().map(ColumnRef::Single).collect());
            }
        }
        // mixture of fixed columns and one slice, zipped per sample
        let mut moving = Vec::new();
        for part in &self.parts {
            if let IndexPart::Slice { start, end, step } = part {
                moving = slice_indices(n_columns, *start, *end, *step);
            }
        }
        let refs = moving
            .into_iter()
            .map(|m| {
                ColumnRef::Tuple(
                    self.parts
                        .iter()
                        .map(|p| match p {
                            IndexPart::Column(c) => *c,
                            IndexPart::Slice { .. } => m,
                        })
                        .collect(),
                )
            })
            .collect();
        ResolvedIndex::PerSample(refs)
    }
}
