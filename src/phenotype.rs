// ==============================================================================
// phenotype.rs - Phenotype Loading
// ==============================================================================
// Description: Adds per-sample phenotype columns from a delimited file
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Input: header row `sample_name<TAB>field...`, one row per sample. Columns
// whose values all parse as numbers become REAL, others TEXT. NA, '.', and
// empty cells are stored as NULL.
// ==============================================================================

use anyhow::{bail, Context, Result};
use rusqlite::types::Value;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::models::PhenotypeSummary;
use crate::project::Project;
use crate::store::{check_identifier, table_columns};

#[derive(Debug, Clone)]
pub struct PhenotypeOptions {
    pub path: PathBuf,
    /// Columns to load, all columns when empty
    pub fields: Vec<String>,
    pub delimiter: u8,
}

fn is_missing(value: &str) -> bool {
    matches!(value.trim(), "" | "NA" | "na" | "N/A" | "." | "None" | "nan" | "NaN")
}

fn to_value(raw: &str, numeric: bool) -> Value {
    if is_missing(raw) {
        return Value::Null;
    }
    if numeric {
        raw.trim().parse::<f64>().map(Value::Real).unwrap_or(Value::Null)
    } else {
        Value::Text(raw.trim().to_string())
    }
}

/// Load phenotypes into the sample table
pub fn load_phenotypes(project: &Project, options: &PhenotypeOptions) -> Result<PhenotypeSummary> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .flexible(false)
        .trim(csv::Trim::All)
        .from_path(&options.path)
        .with_context(|| format!("Failed to open phenotype file {}", options.path.display()))?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim_start_matches('#').to_string()).collect();
    if headers.len() < 2 {
        bail!("Phenotype file needs a sample column and at least one phenotype column");
    }
    let rows: Vec<csv::StringRecord> = reader.records().collect::<std::result::Result<_, _>>()?;

    let mut selected: Vec<usize> = Vec::new();
    for (idx, name) in headers.iter().enumerate().skip(1) {
        if options.fields.is_empty() || options.fields.iter().any(|f| f.eq_ignore_ascii_case(name)) {
            check_identifier(name)?;
            selected.push(idx);
        }
    }
    for field in &options.fields {
        if !headers.iter().any(|h| h.eq_ignore_ascii_case(field)) {
            bail!("Field {} is not in {}", field, options.path.display());
        }
    }

    let store = project.store()?;
    let conn = store.connection();
    let existing = table_columns(conn, "main", "sample")?;
    let mut numeric = Vec::with_capacity(selected.len());
    for &idx in &selected {
        let is_numeric = rows.iter().all(|row| {
            let value = row.get(idx).unwrap_or("");
            is_missing(value) || value.parse::<f64>().is_ok()
        });
        numeric.push(is_numeric);
        let name = &headers[idx];
        if !existing.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            let sql_type = if is_numeric { "REAL" } else { "TEXT" };
            info!("Adding phenotype {} ({})", name, sql_type);
            conn.execute_batch(&format!("ALTER TABLE sample ADD {} {};", name, sql_type))?;
        }
    }

    let mut summary = PhenotypeSummary {
        fields: selected.iter().map(|&i| headers[i].clone()).collect(),
        ..Default::default()
    };
    store.begin()?;
    for row in &rows {
        let sample = row.get(0).unwrap_or("");
        let mut changed = 0;
        for (pos, &idx) in selected.iter().enumerate() {
            let value = to_value(row.get(idx).unwrap_or(""), numeric[pos]);
            changed = conn.execute(
                &format!("UPDATE sample SET {} = ?1 WHERE sample_name = ?2", headers[idx]),
                rusqlite::params![value, sample],
            )?;
        }
        if changed == 0 {
            warn!("Sample {} is not in the project", sample);
            summary.samples_unmatched += 1;
        } else {
            summary.samples_updated += changed;
        }
    }
    store.commit()?;
    info!(
        "Loaded {} phenotypes for {} samples ({} unmatched)",
        summary.fields.len(),
        summary.samples_updated,
        summary.samples_unmatched
    );
    Ok(summary)
}
