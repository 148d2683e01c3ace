// ==============================================================================
// writer.rs - Batched Genotype Writer
// ==============================================================================
// Description: Per-sample row buffers flushed to the store in bulk inserts
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use std::collections::BTreeMap;
use tracing::{debug, error};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{GenotypeRow, SampleId};

/// Destination of flushed genotype batches
pub trait GenotypeSink {
    /// Append rows to the sample's table in the given order
    fn write_batch(&mut self, sample: SampleId, rows: &[GenotypeRow]) -> rusqlite::Result<()>;

    /// Make all written batches durable
    fn commit(&mut self) -> rusqlite::Result<()>;
}

/// Buffers rows per sample and bulk-writes them once `batch_size` is reached
///
/// Rows of one sample reach the sink in `write` order. A failed flush is
/// returned as [`PipelineError::Flush`] and never retried; a partially written
/// sample can only be repaired by re-importing its file.
pub struct BatchedWriter<S: GenotypeSink> {
    sink: S,
    buffers: BTreeMap<SampleId, Vec<GenotypeRow>>,
    batch_size: usize,
    flushes_per_commit: u64,
    flushes_since_commit: u64,
    rows_written: u64,
}

impl<S: GenotypeSink> BatchedWriter<S> {
    pub fn new(sink: S, batch_size: usize, flushes_per_commit: u64) -> Self {
        Self {
            sink,
            buffers: BTreeMap::new(),
            batch_size: batch_size.max(1),
            flushes_per_commit: flushes_per_commit.max(1),
            flushes_since_commit: 0,
            rows_written: 0,
        }
    }

    pub fn write(&mut self, sample: SampleId, row: GenotypeRow) -> PipelineResult<()> {
        let buffer = self.buffers.entry(sample).or_default();
        buffer.push(row);
        if buffer.len() >= self.batch_size {
            let rows = std::mem::take(buffer);
            self.flush_rows(sample, rows)?;
        }
        Ok(())
    }

    fn flush_rows(&mut self, sample: SampleId, rows: Vec<GenotypeRow>) -> PipelineResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        if let Err(source) = self.sink.write_batch(sample, &rows) {
            error!("Failed to write {} genotypes of sample {}: {}", rows.len(), sample, source);
            return Err(PipelineError::Flush {
                sample,
                rows: rows.len(),
                source,
            });
        }
        self.rows_written += rows.len() as u64;
        self.flushes_since_commit += 1;
        if self.flushes_since_commit >= self.flushes_per_commit {
            debug!("Committing genotypes after {} flushes", self.flushes_since_commit);
            self.sink.commit()?;
            self.flushes_since_commit = 0;
        }
        Ok(())
    }

    /// Rows handed to the sink so far
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Rows still buffered
    pub fn pending(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }

    /// Flush every buffer, commit, and hand back the sink
    pub fn close(mut self) -> PipelineResult<S> {
        let buffers = std::mem::take(&mut self.buffers);
        for (sample, rows) in buffers {
            self.flush_rows(sample, rows)?;
        }
        self.sink.commit()?;
        Ok(self.sink)
    }
}
