// ==============================================================================
// error.rs - Pipeline Error Taxonomy
// ==============================================================================
// Description: Record, configuration, group and infrastructure error types
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Severity ladder:
//   RecordError   - one input line is skipped and counted, run continues
//   GroupError    - one group reports NaN results, run continues
//   ConfigError   - rejected before any work starts
//   PipelineError - entity load failures and infrastructure faults abort the run
// ==============================================================================

use thiserror::Error;

/// Errors raised while turning one raw line into records
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("Line {line}: expected {expected} columns, found {found}")]
    ColumnCount {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("Line {line}: column {column} is out of range")]
    ColumnOutOfRange { line: u64, column: usize },

    #[error("Line {line}: invalid position '{value}'")]
    InvalidPosition { line: u64, value: String },

    #[error("Line {line}: allele '{value}' is not plain ASCII")]
    InvalidAllele { line: u64, value: String },

    #[error("Line {line}: nested multi-valued field '{field}'")]
    NestedValues { line: u64, field: String },

    /// The first data line produced an unusable column layout. Unlike the
    /// other variants this one cannot be recovered by skipping the line.
    #[error("Inconsistent column layout: {0}")]
    Layout(String),
}

impl RecordError {
    /// True when skipping the offending line is not enough to continue
    pub fn is_fatal(&self) -> bool {
        matches!(self, RecordError::Layout(_))
    }
}

/// Errors in format descriptors, settings and method specifications
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid index expression '{expr}': {reason}")]
    IndexExpression { expr: String, reason: String },

    #[error("Invalid format descriptor: {0}")]
    Format(String),

    #[error("Unknown association method '{0}'")]
    UnknownMethod(String),

    #[error("Invalid arguments for method '{method}': {reason}")]
    MethodArguments { method: String, reason: String },

    #[error("Invalid setting: {0}")]
    Setting(String),

    #[error("Invalid identifier '{0}'")]
    Identifier(String),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that fail a single group; results become NaN
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GroupError {
    #[error("Sample size too small ({0} samples) to be useful")]
    TooFewSamples(usize),

    #[error("No variant left after missingness filtering")]
    NoVariants,

    #[error("Computation exceeded the {0:?} time limit")]
    Timeout(std::time::Duration),

    #[error("Phenotype is not binary (expected 0/1 coding)")]
    NonBinaryPhenotype,

    #[error("Degenerate data: {0}")]
    Degenerate(String),

    #[error("Failed to read group data: {0}")]
    Data(String),
}

/// Entity-level and infrastructure errors that abort a run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to load genotypes of sample {sample} in loader {loader}: {reason}")]
    EntityLoad {
        sample: i64,
        loader: usize,
        reason: String,
    },

    #[error("Failed to flush {rows} buffered rows of sample {sample}: {source}")]
    Flush {
        sample: i64,
        rows: usize,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Worker '{0}' panicked")]
    WorkerPanicked(String),

    #[error("Worker '{worker}' failed: {reason}")]
    WorkerFailed { worker: String, reason: String },

    #[error("Run aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
