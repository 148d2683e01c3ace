// ==============================================================================
// format/transform.rs - Field Transform Registry
// ==============================================================================
// Description: Named value transforms applied to raw columns during parsing
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Transforms are declared by name in a format descriptor, e.g.
//   {"fn": "SplitField", "sep": ","}
// and resolved once into a `Transform` when the descriptor is loaded. An
// unknown name fails deserialization, so nothing is looked up per line.
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::binning::{shared_prefix_len, shared_suffix_len};

/// Value of one field while it moves through a transform chain
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Missing,
    Text(String),
    /// Several raw columns handed to one transform (e.g. FORMAT and sample)
    Columns(Vec<String>),
    /// Multi-valued result; the line expands into one record per element
    Multi(Vec<Option<String>>),
}

impl FieldValue {
    /// Number of records this value asks for
    pub fn width(&self) -> usize {
        match self {
            FieldValue::Multi(values) => values.len(),
            _ => 1,
        }
    }

    /// Value of this field in the `i`-th expanded record
    pub fn expand(&self, i: usize) -> Option<String> {
        match self {
            FieldValue::Missing | FieldValue::Columns(_) => None,
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Multi(values) => values.get(i).cloned().flatten(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    /// The whole line must be dropped without counting it as an error
    #[error("record discarded")]
    Discard,

    #[error("{0}")]
    Failed(String),
}

fn default_semicolon() -> String {
    ";".to_string()
}

fn default_comma() -> String {
    ",".to_string()
}

fn default_colon() -> String {
    ":".to_string()
}

fn default_increment() -> i64 {
    1
}

/// One value or a list of values to match against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Matcher {
    One(String),
    Many(Vec<String>),
}

impl Matcher {
    fn matches(&self, item: &str) -> bool {
        match self {
            Matcher::One(v) => v == item,
            Matcher::Many(vs) => vs.iter().any(|v| v == item),
        }
    }
}

/// Transform declarations as they appear in a format descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn")]
pub enum TransformSpec {
    /// `index`-th (1-based) item of a `sep`-delimited field
    ExtractField {
        index: usize,
        #[serde(default = "default_semicolon")]
        sep: String,
        #[serde(default)]
        default: Option<String>,
    },
    /// Split only when the separator is present
    CheckSplit {
        #[serde(default = "default_comma")]
        sep: String,
    },
    SplitField {
        #[serde(default = "default_comma")]
        sep: String,
    },
    /// "1" if `name` is one of the `sep`-delimited items, "0" otherwise
    ExtractFlag {
        name: String,
        #[serde(default = "default_semicolon")]
        sep: String,
    },
    /// Text after `name` up to the next `sep`
    ExtractValue {
        name: String,
        #[serde(default = "default_semicolon")]
        sep: String,
        #[serde(default)]
        default: Option<String>,
    },
    /// Value of `name` from a (format, value) column pair
    FieldFromFormat {
        name: String,
        #[serde(default = "default_colon")]
        sep: String,
        #[serde(default)]
        default: Option<String>,
    },
    VcfGenotype {
        #[serde(default)]
        default: Option<String>,
    },
    /// Genotype from a (format, value) column pair
    VcfGenoFromFormat {
        #[serde(default)]
        default: Option<String>,
    },
    EncodeGenotype {
        #[serde(default)]
        default: Option<String>,
    },
    IncreaseBy {
        #[serde(default = "default_increment")]
        inc: i64,
    },
    MapValue {
        map: HashMap<String, String>,
        #[serde(default)]
        default: Option<String>,
    },
    RemoveLeading {
        val: String,
    },
    Nullify {
        val: Matcher,
    },
    DiscardRecord {
        val: Matcher,
    },
    /// Shared leading bases of a (ref, alt) column pair
    CommonLeading,
    /// Shared trailing bases of a (ref, alt) pair after leading bases are removed
    CommonEnding,
}

/// Genotype coding for diploid calls. The second alternate allele of a
/// multi-allelic site lands in the second expanded record; `-1` marks a
/// heterozygote carrying both alternates.
fn genotype_code(call: &str, default: &Option<String>) -> Option<FieldValue> {
    let multi = |codes: &[&str]| FieldValue::Multi(codes.iter().map(|c| Some(c.to_string())).collect());
    let value = match call {
        "0/0" | "0|0" | "0" => match default {
            Some(d) => FieldValue::Multi(vec![Some(d.clone())]),
            None => FieldValue::Missing,
        },
        "0/1" | "1/0" | "0|1" | "1|0" | "1" => multi(&["1"]),
        "1/1" | "1|1" => multi(&["2"]),
        "0/2" | "2/0" | "0|2" | "2|0" => multi(&["0", "1"]),
        "1/2" | "2/1" | "1|2" | "2|1" => multi(&["-1", "-1"]),
        "2/2" | "2|2" => multi(&["0", "2"]),
        _ => return None,
    };
    Some(value)
}

fn common_leading(ref_allele: &str, alt: &str) -> String {
    ref_allele[..shared_prefix_len(ref_allele, alt)].to_string()
}

fn common_ending(ref_allele: &str, alt: &str) -> String {
    let lead = shared_prefix_len(ref_allele, alt);
    let (r, a) = (&ref_allele[lead..], &alt[lead..]);
    r[r.len() - shared_suffix_len(r, a)..].to_string()
}

/// A resolved transform, ready to be applied to field values
#[derive(Debug, Clone)]
pub struct Transform {
    spec: TransformSpec,
    /// Per-format lookup cache for the `*FromFormat` transforms
    format_index: HashMap<String, Option<usize>>,
}

impl Transform {
    pub fn resolve(spec: TransformSpec) -> Result<Self, String> {
        match &spec {
            TransformSpec::ExtractField { index: 0, .. } => {
                return Err("ExtractField index is 1-based".to_string());
            }
            TransformSpec::CheckSplit { sep }
            | TransformSpec::SplitField { sep }
            | TransformSpec::ExtractField { sep, .. }
            | TransformSpec::ExtractFlag { sep, .. }
            | TransformSpec::ExtractValue { sep, .. }
            | TransformSpec::FieldFromFormat { sep, .. }
                if sep.is_empty() =>
            {
                return Err("separator must not be empty".to_string());
            }
            _ => {}
        }
        Ok(Self {
            spec,
            format_index: HashMap::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self.spec {
            TransformSpec::ExtractField { .. } => "ExtractField",
            TransformSpec::CheckSplit { .. } => "CheckSplit",
            TransformSpec::SplitField { .. } => "SplitField",
            TransformSpec::ExtractFlag { .. } => "ExtractFlag",
            TransformSpec::ExtractValue { .. } => "ExtractValue",
            TransformSpec::FieldFromFormat { .. } => "FieldFromFormat",
            TransformSpec::VcfGenotype { .. } => "VcfGenotype",
            TransformSpec::VcfGenoFromFormat { .. } => "VcfGenoFromFormat",
            TransformSpec::EncodeGenotype { .. } => "EncodeGenotype",
            TransformSpec::IncreaseBy { .. } => "IncreaseBy",
            TransformSpec::MapValue { .. } => "MapValue",
            TransformSpec::RemoveLeading { .. } => "RemoveLeading",
            TransformSpec::Nullify { .. } => "Nullify",
            TransformSpec::DiscardRecord { .. } => "DiscardRecord",
            TransformSpec::CommonLeading => "CommonLeading",
            TransformSpec::CommonEnding => "CommonEnding",
        }
    }

    fn text<'a>(&self, item: &'a FieldValue) -> Result<&'a str, TransformError> {
        match item {
            FieldValue::Text(s) => Ok(s),
            _ => Err(TransformError::Failed(format!("{} expects a single column", self.name()))),
        }
    }

    fn pair<'a>(&self, item: &'a FieldValue) -> Result<(&'a str, &'a str), TransformError> {
        match item {
            FieldValue::Columns(cols) if cols.len() == 2 => Ok((&cols[0], &cols[1])),
            _ => Err(TransformError::Failed(format!("{} expects two columns", self.name()))),
        }
    }

    fn lookup_format(&mut self, format: &str, name: &str, sep: &str) -> Option<usize> {
        if let Some(idx) = self.format_index.get(format) {
            return *idx;
        }
        let idx = format.split(sep).position(|f| f == name);
        self.format_index.insert(format.to_string(), idx);
        idx
    }

    /// Apply to a single (non multi-valued) value
    pub fn apply(&mut self, item: &FieldValue) -> Result<FieldValue, TransformError> {
        let out = match &self.spec {
            TransformSpec::ExtractField { index, sep, default } => {
                let s = self.text(item)?;
                match s.split(sep.as_str()).nth(index - 1) {
                    Some(v) => FieldValue::Text(v.to_string()),
                    None => opt_text(default),
                }
            }
            TransformSpec::CheckSplit { sep } => {
                let s = self.text(item)?;
                if s.contains(sep.as_str()) {
                    FieldValue::Multi(s.split(sep.as_str()).map(|v| Some(v.to_string())).collect())
                } else {
                    FieldValue::Text(s.to_string())
                }
            }
            TransformSpec::SplitField { sep } => {
                let s = self.text(item)?;
                FieldValue::Multi(s.split(sep.as_str()).map(|v| Some(v.to_string())).collect())
            }
            TransformSpec::ExtractFlag { name, sep } => {
                let s = self.text(item)?;
                let found = s.split(sep.as_str()).any(|f| f == name);
                FieldValue::Text(if found { "1" } else { "0" }.to_string())
            }
            TransformSpec::ExtractValue { name, sep, default } => {
                let s = self.text(item)?;
                match s.find(name.as_str()) {
                    Some(at) => {
                        let rest = &s[at + name.len()..];
                        let value = rest.split(sep.as_str()).next().unwrap_or_default();
                        FieldValue::Text(value.to_string())
                    }
                    None => opt_text(default),
                }
            }
            TransformSpec::FieldFromFormat { name, sep, default } => {
                let (format, value) = self.pair(item)?;
                let (name, sep, default) = (name.clone(), sep.clone(), default.clone());
                match self.lookup_format(format, &name, &sep) {
                    Some(idx) => match value.split(sep.as_str()).nth(idx) {
                        Some(v) => FieldValue::Text(v.to_string()),
                        None => opt_text(&default),
                    },
                    None => opt_text(&default),
                }
            }
            TransformSpec::VcfGenotype { default } => {
                let s = self.text(item)?;
                let call = s.split(':').next().unwrap_or_default();
                genotype_code(call, default).unwrap_or(FieldValue::Missing)
            }
            TransformSpec::VcfGenoFromFormat { default } => {
                let (format, value) = self.pair(item)?;
                let default = default.clone();
                match self.lookup_format(format, "GT", ":") {
                    Some(idx) => match value.split(':').nth(idx) {
                        Some(call) => genotype_code(call, &default).unwrap_or(FieldValue::Missing),
                        None => FieldValue::Missing,
                    },
                    None => opt_multi(&default),
                }
            }
            TransformSpec::EncodeGenotype { default } => {
                let s = self.text(item)?;
                genotype_code(s, default)
                    .ok_or_else(|| TransformError::Failed(format!("unrecognized genotype '{}'", s)))?
            }
            TransformSpec::IncreaseBy { inc } => {
                let s = self.text(item)?;
                if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                    let v: i64 = s
                        .parse()
                        .map_err(|e| TransformError::Failed(format!("{}: {}", s, e)))?;
                    FieldValue::Text((v + inc).to_string())
                } else {
                    FieldValue::Missing
                }
            }
            TransformSpec::MapValue { map, default } => {
                let s = self.text(item)?;
                match map.get(s) {
                    Some(v) => FieldValue::Text(v.clone()),
                    None => opt_text(default),
                }
            }
            TransformSpec::RemoveLeading { val } => {
                let s = self.text(item)?;
                FieldValue::Text(s.strip_prefix(val.as_str()).unwrap_or(s).to_string())
            }
            TransformSpec::Nullify { val } => {
                let s = self.text(item)?;
                if val.matches(s) {
                    FieldValue::Missing
                } else {
                    FieldValue::Text(s.to_string())
                }
            }
            TransformSpec::DiscardRecord { val } => {
                let s = self.text(item)?;
                if val.matches(s) {
                    return Err(TransformError::Discard);
                }
                FieldValue::Text(s.to_string())
            }
            TransformSpec::CommonLeading => {
                let (r, a) = self.pair(item)?;
                per_alt(r, a, common_leading)
            }
            TransformSpec::CommonEnding => {
                let (r, a) = self.pair(item)?;
                per_alt(r, a, common_ending)
            }
        };
        Ok(out)
    }
}

fn opt_text(value: &Option<String>) -> FieldValue {
    match value {
        Some(v) => FieldValue::Text(v.clone()),
        None => FieldValue::Missing,
    }
}

fn opt_multi(value: &Option<String>) -> FieldValue {
    match value {
        Some(v) => FieldValue::Multi(vec![Some(v.clone())]),
        None => FieldValue::Missing,
    }
}

fn per_alt(ref_allele: &str, alt: &str, f: fn(&str, &str) -> String) -> FieldValue {
    if alt.contains(',') {
        FieldValue::Multi(alt.split(',').map(|a| Some(f(ref_allele, a))).collect())
    } else {
        FieldValue::Text(f(ref_allele, alt))
    }
}

/// Ordered list of transforms applied to one field
#[derive(Debug, Clone, Default)]
pub struct TransformChain {
    steps: Vec<Transform>,
}

impl TransformChain {
    pub fn resolve(specs: &[TransformSpec]) -> Result<Self, String> {
        let steps = specs
            .iter()
            .cloned()
            .map(Transform::resolve)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { steps })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the chain. Once a value is multi-valued, later transforms are
    /// applied to each element; a missing or empty value stops the chain.
    pub fn apply(&mut self, item: FieldValue) -> Result<FieldValue, TransformError> {
        let mut item = item;
        for step in self.steps.iter_mut() {
            item = match item {
                FieldValue::Missing => return Ok(FieldValue::Missing),
                FieldValue::Text(s) if s.is_empty() => return Ok(FieldValue::Text(s)),
                FieldValue::Multi(values) => {
                    let mut out = Vec::with_capacity(values.len());
                    for value in values {
                        let Some(v) = value else {
                            out.push(None);
                            continue;
                        };
                        match step.apply(&FieldValue::Text(v))? {
                            FieldValue::Text(t) => out.push(Some(t)),
                            FieldValue::Missing => out.push(None),
                            FieldValue::Multi(_) | FieldValue::Columns(_) => {
                                return Err(TransformError::Failed(
                                    "nested multi-valued field is not allowed".to_string(),
                                ));
                            }
                        }
                    }
                    FieldValue::Multi(out)
                }
                other => step.apply(&other)?,
            };
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(json: &str) -> TransformChain {
        let specs: Vec<TransformSpec> = serde_json::from_str(json).unwrap();
        TransformChain::resolve(&specs).unwrap()
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.to_string())
    }

    fn multi(values: &[&str]) -> FieldValue {
        FieldValue::Multi(values.iter().map(|v| Some(v.to_string())).collect())
    }

    #[test]
    fn test_unknown_transform_rejected_at_parse_time() {
        let result: Result<Vec<TransformSpec>, _> = serde_json::from_str(r#"[{"fn": "Bogus"}]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_genotype_coding_table() {
        let mut t = chain(r#"[{"fn": "VcfGenotype"}]"#);
        assert_eq!(t.apply(text("0/0")).unwrap(), FieldValue::Missing);
        assert_eq!(t.apply(text("0|1:35")).unwrap(), multi(&["1"]));
        assert_eq!(t.apply(text("1/1")).unwrap(), multi(&["2"]));
        assert_eq!(t.apply(text("0/2")).unwrap(), multi(&["0", "1"]));
        assert_eq!(t.apply(text("1/2")).unwrap(), multi(&["-1", "-1"]));
        assert_eq!(t.apply(text("2|2")).unwrap(), multi(&["0", "2"]));
        assert_eq!(t.apply(text("./.")).unwrap(), FieldValue::Missing);
    }

    #[test]
    fn test_genotype_default_for_reference_calls() {
        let mut t = chain(r#"[{"fn": "VcfGenotype", "default": "0"}]"#);
        assert_eq!(t.apply(text("0/0")).unwrap(), multi(&["0"]));
    }

    #[test]
    fn test_geno_from_format_follows_format_column() {
        let mut t = chain(r#"[{"fn": "VcfGenoFromFormat"}]"#);
        let item = FieldValue::Columns(vec!["DP:GT".into(), "12:1/1".into()]);
        assert_eq!(t.apply(item).unwrap(), multi(&["2"]));
        let item = FieldValue::Columns(vec!["DP".into(), "12".into()]);
        assert_eq!(t.apply(item).unwrap(), FieldValue::Missing);
    }

    #[test]
    fn test_field_from_format() {
        let mut t = chain(r#"[{"fn": "FieldFromFormat", "name": "DP"}]"#);
        let item = FieldValue::Columns(vec!["GT:DP".into(), "0/1:17".into()]);
        assert_eq!(t.apply(item).unwrap(), text("17"));
    }

    #[test]
    fn test_info_extractors() {
        let info = "DP=30;AF=0.5;DB;H2";
        assert_eq!(chain(r#"[{"fn": "ExtractValue", "name": "AF="}]"#).apply(text(info)).unwrap(), text("0.5"));
        assert_eq!(chain(r#"[{"fn": "ExtractFlag", "name": "DB"}]"#).apply(text(info)).unwrap(), text("1"));
        assert_eq!(chain(r#"[{"fn": "ExtractFlag", "name": "D"}]"#).apply(text(info)).unwrap(), text("0"));
        assert_eq!(chain(r#"[{"fn": "ExtractField", "index": 2}]"#).apply(text(info)).unwrap(), text("AF=0.5"));
        assert_eq!(
            chain(r#"[{"fn": "ExtractValue", "name": "XX=", "default": "NA"}]"#).apply(text(info)).unwrap(),
            text("NA")
        );
    }

    #[test]
    fn test_split_then_apply_elementwise() {
        let mut t = chain(r#"[{"fn": "SplitField"}, {"fn": "IncreaseBy", "inc": 10}]"#);
        assert_eq!(t.apply(text("1,2,x")).unwrap(), FieldValue::Multi(vec![Some("11".into()), Some("12".into()), None]));
    }

    #[test]
    fn test_check_split_keeps_single_value() {
        let mut t = chain(r#"[{"fn": "CheckSplit"}]"#);
        assert_eq!(t.apply(text("A")).unwrap(), text("A"));
        assert_eq!(t.apply(text("A,T")).unwrap(), multi(&["A", "T"]));
    }

    #[test]
    fn test_nested_split_is_an_error() {
        let mut t = chain(r#"[{"fn": "SplitField"}, {"fn": "SplitField", "sep": "|"}]"#);
        assert!(matches!(t.apply(text("a|b,c")), Err(TransformError::Failed(_))));
    }

    #[test]
    fn test_discard_and_nullify() {
        let mut t = chain(r#"[{"fn": "DiscardRecord", "val": ["LowQual", "q10"]}]"#);
        assert_eq!(t.apply(text("q10")), Err(TransformError::Discard));
        assert_eq!(t.apply(text("PASS")).unwrap(), text("PASS"));

        let mut t = chain(r#"[{"fn": "Nullify", "val": "."}]"#);
        assert_eq!(t.apply(text(".")).unwrap(), FieldValue::Missing);
    }

    #[test]
    fn test_map_and_remove_leading() {
        let mut t = chain(r#"[{"fn": "RemoveLeading", "val": "chr"}, {"fn": "MapValue", "map": {"M": "MT"}}]"#);
        assert_eq!(t.apply(text("chrM")).unwrap(), text("MT"));
        assert_eq!(t.apply(text("chr1")).unwrap(), FieldValue::Missing);
    }

    #[test]
    fn test_common_leading_and_ending() {
        let pair = FieldValue::Columns(vec!["ACCT".into(), "AGCT,ACT".into()]);
        assert_eq!(chain(r#"[{"fn": "CommonLeading"}]"#).apply(pair.clone()).unwrap(), multi(&["A", "AC"]));
        assert_eq!(chain(r#"[{"fn": "CommonEnding"}]"#).apply(pair).unwrap(), multi(&["CT", "T"]));
    }

    #[test]
    fn test_common_affixes_cut_on_char_boundaries() {
        let pair = FieldValue::Columns(vec!["é".into(), "ê".into()]);
        assert_eq!(chain(r#"[{"fn": "CommonLeading"}]"#).apply(pair.clone()).unwrap(), text(""));
        assert_eq!(chain(r#"[{"fn": "CommonEnding"}]"#).apply(pair).unwrap(), text(""));
    }

    #[test]
    fn test_empty_value_stops_chain() {
        let mut t = chain(r#"[{"fn": "IncreaseBy"}]"#);
        assert_eq!(t.apply(text("")).unwrap(), text(""));
    }
}
