// ==============================================================================
// models.rs - Pipeline Data Models
// ==============================================================================
// Description: Variant identities, parsed records, group keys and run summaries
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Stored identifier of a variant row
pub type VariantId = u64;

/// Stored identifier of a sample (one genotype table per sample)
pub type SampleId = i64;

/// Variant identity: chromosome, position and normalized alleles
///
/// Deduplication keys on `(chr, ref_allele, alt_allele)` first and uses the
/// position as a secondary key, so two variants at different positions with
/// the same alleles remain distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantIdentity {
    pub chr: String,
    pub pos: u64,
    pub ref_allele: String,
    pub alt_allele: String,
}

impl VariantIdentity {
    pub fn new(chr: &str, pos: u64, ref_allele: &str, alt_allele: &str) -> Self {
        Self {
            chr: chr.to_string(),
            pos,
            ref_allele: ref_allele.to_string(),
            alt_allele: alt_allele.to_string(),
        }
    }

    /// Classify the variant after normalization (`-` marks an empty allele)
    pub fn kind(&self) -> VariantKind {
        if self.ref_allele == "-" {
            VariantKind::Insertion
        } else if self.alt_allele == "-" {
            VariantKind::Deletion
        } else if self.ref_allele.len() == 1 && self.alt_allele.len() == 1 {
            VariantKind::Snv
        } else {
            VariantKind::Complex
        }
    }
}

/// Variant classes counted during import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Snv,
    Insertion,
    Deletion,
    Complex,
}

/// One record produced by the parser
///
/// A single input line may expand into several records (one per alternate
/// allele); `sub_index` keeps those in their original order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    /// 1-based line number in the input file
    pub line_no: u64,
    /// Position of this record among the expansions of its line
    pub sub_index: u32,
    /// UCSC bin of the variant, if it has a position
    pub bin: Option<u32>,
    /// Output columns: variant fields, variant info, genotype and genotype info
    pub fields: Vec<Option<String>>,
}

impl ParsedRecord {
    /// Merge key used to restore input order
    pub fn order_key(&self) -> (u64, u32) {
        (self.line_no, self.sub_index)
    }

    pub fn field(&self, idx: usize) -> Option<&str> {
        self.fields.get(idx).and_then(|f| f.as_deref())
    }
}

/// A genotype row destined for one sample's genotype table
#[derive(Debug, Clone, PartialEq)]
pub struct GenotypeRow {
    pub variant_id: VariantId,
    /// Genotype code followed by genotype info values
    pub values: Vec<Option<String>>,
}

/// One component of a group key (mirrors the SQLite storage classes)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl GroupValue {
    fn rank(&self) -> u8 {
        match self {
            GroupValue::Null => 0,
            GroupValue::Int(_) | GroupValue::Real(_) => 1,
            GroupValue::Text(_) => 2,
        }
    }
}

impl PartialEq for GroupValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GroupValue {}

impl Hash for GroupValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            GroupValue::Null => 0u8.hash(state),
            // Ints and integral reals compare equal, so they must hash alike
            GroupValue::Int(v) => (*v as f64).to_bits().hash(state),
            GroupValue::Real(v) => v.to_bits().hash(state),
            GroupValue::Text(s) => s.hash(state),
        }
    }
}

impl PartialOrd for GroupValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (GroupValue::Int(a), GroupValue::Int(b)) => a.cmp(b),
            (GroupValue::Int(a), GroupValue::Real(b)) => (*a as f64).total_cmp(b),
            (GroupValue::Real(a), GroupValue::Int(b)) => a.total_cmp(&(*b as f64)),
            (GroupValue::Real(a), GroupValue::Real(b)) => a.total_cmp(b),
            (GroupValue::Text(a), GroupValue::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for GroupValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupValue::Null => write!(f, "NA"),
            GroupValue::Int(v) => write!(f, "{}", v),
            GroupValue::Real(v) => write!(f, "{}", v),
            GroupValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl ToSql for GroupValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            GroupValue::Null => ToSqlOutput::Owned(Value::Null),
            GroupValue::Int(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            GroupValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            GroupValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl FromSql for GroupValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => GroupValue::Null,
            ValueRef::Integer(v) => GroupValue::Int(v),
            ValueRef::Real(v) => GroupValue::Real(v),
            ValueRef::Text(t) | ValueRef::Blob(t) => {
                GroupValue::Text(String::from_utf8_lossy(t).into_owned())
            }
        })
    }
}

/// Values of the grouping fields that define one group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey(pub Vec<GroupValue>);

impl GroupKey {
    pub fn values(&self) -> &[GroupValue] {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Outcome of an import run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub files_imported: usize,
    pub files_ignored: usize,
    pub lines_processed: u64,
    pub records_processed: u64,
    pub records_skipped: u64,
    pub samples_created: usize,
    pub genotypes_written: u64,
    pub new_variants: u64,
    pub updated_variants: u64,
    pub snv: u64,
    pub insertions: u64,
    pub deletions: u64,
    pub complex: u64,
}

impl ImportSummary {
    pub fn merge(&mut self, other: &ImportSummary) {
        self.files_imported += other.files_imported;
        self.files_ignored += other.files_ignored;
        self.lines_processed += other.lines_processed;
        self.records_processed += other.records_processed;
        self.records_skipped += other.records_skipped;
        self.samples_created += other.samples_created;
        self.genotypes_written += other.genotypes_written;
        self.new_variants += other.new_variants;
        self.updated_variants += other.updated_variants;
        self.snv += other.snv;
        self.insertions += other.insertions;
        self.deletions += other.deletions;
        self.complex += other.complex;
    }

    pub fn count_kind(&mut self, kind: VariantKind) {
        match kind {
            VariantKind::Snv => self.snv += 1,
            VariantKind::Insertion => self.insertions += 1,
            VariantKind::Deletion => self.deletions += 1,
            VariantKind::Complex => self.complex += 1,
        }
    }
}

/// Outcome of an export run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub variants_exported: u64,
    pub samples: usize,
    pub reader_threads: usize,
}

/// Outcome of a phenotype load
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhenotypeSummary {
    pub fields: Vec<String>,
    pub samples_updated: usize,
    pub samples_unmatched: usize,
}

/// Outcome of an association run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssociationSummary {
    pub run_id: String,
    pub samples: usize,
    pub groups_total: usize,
    pub groups_skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub loaders: usize,
    pub workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_variant_kind() {
        assert_eq!(VariantIdentity::new("1", 10, "A", "G").kind(), VariantKind::Snv);
        assert_eq!(VariantIdentity::new("1", 10, "-", "G").kind(), VariantKind::Insertion);
        assert_eq!(VariantIdentity::new("1", 10, "AT", "-").kind(), VariantKind::Deletion);
        assert_eq!(VariantIdentity::new("1", 10, "AT", "GC").kind(), VariantKind::Complex);
    }

    #[test]
    fn test_group_value_ordering_and_hashing() {
        let mut keys = vec![
            GroupKey(vec![GroupValue::Text("2".into()), GroupValue::Int(5)]),
            GroupKey(vec![GroupValue::Text("1".into()), GroupValue::Int(20)]),
            GroupKey(vec![GroupValue::Text("1".into()), GroupValue::Int(3)]),
        ];
        keys.sort();
        assert_eq!(keys[0].to_string(), "1,3");
        assert_eq!(keys[2].to_string(), "2,5");

        let mut set = HashSet::new();
        set.insert(GroupKey(vec![GroupValue::Int(3)]));
        assert!(set.contains(&GroupKey(vec![GroupValue::Real(3.0)])));
    }

    #[test]
    fn test_group_key_json_roundtrip() {
        let key = GroupKey(vec![GroupValue::Text("X".into()), GroupValue::Int(1000), GroupValue::Null]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"["X",1000,null]"#);
        let back: GroupKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_summary_merge() {
        let mut total = ImportSummary::default();
        let mut one = ImportSummary {
            files_imported: 1,
            records_processed: 10,
            ..Default::default()
        };
        one.count_kind(VariantKind::Snv);
        total.merge(&one);
        total.merge(&one);
        assert_eq!(total.files_imported, 2);
        assert_eq!(total.records_processed, 20);
        assert_eq!(total.snv, 2);
    }
}
