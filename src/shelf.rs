// ==============================================================================
// shelf.rs - Sample Cache
// ==============================================================================
// Description: Per-loader key-value file of genotypes by (sample, group)
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{GroupError, PipelineResult};
use crate::models::{GroupKey, SampleId, VariantId};

/// Genotype code of each variant of one group for one sample
pub type GenotypeSlice = BTreeMap<VariantId, Option<f64>>;

pub fn shelf_path(dir: &Path, loader: usize) -> PathBuf {
    dir.join(format!("geno_{}.shelf", loader))
}

/// `{sample},{group values as JSON}`, so NULL and quoted text never collide
pub fn shelf_key(sample: SampleId, group: &GroupKey) -> serde_json::Result<String> {
    Ok(format!("{},{}", sample, serde_json::to_string(&group.0)?))
}

pub struct Shelf {
    conn: Connection,
    path: PathBuf,
}

impl Shelf {
    /// Create an empty shelf, replacing any file left by an earlier run
    pub fn create(path: &Path) -> PipelineResult<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = OFF;
             PRAGMA synchronous = OFF;
             CREATE TABLE shelf (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn open_read_only(path: &Path) -> PipelineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn begin(&self) -> rusqlite::Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    pub fn commit(&self) -> rusqlite::Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    pub fn rollback(&self) -> rusqlite::Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    pub fn put(&self, sample: SampleId, group: &GroupKey, slice: &GenotypeSlice) -> rusqlite::Result<()> {
        let to_sql_error = |e: serde_json::Error| rusqlite::Error::ToSqlConversionFailure(Box::new(e));
        let key = shelf_key(sample, group).map_err(to_sql_error)?;
        let value = serde_json::to_string(slice).map_err(to_sql_error)?;
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO shelf (key, value) VALUES (?1, ?2)")?
            .execute(params![key, value])?;
        Ok(())
    }

    /// `None` when the sample has no genotype in the group
    pub fn get(&self, sample: SampleId, group: &GroupKey) -> Result<Option<GenotypeSlice>, GroupError> {
        let key = shelf_key(sample, group).map_err(|e| GroupError::Data(e.to_string()))?;
        let value: Option<String> = self
            .conn
            .prepare_cached("SELECT value FROM shelf WHERE key = ?1")
            .and_then(|mut stmt| stmt.query_row([&key], |row| row.get(0)).optional())
            .map_err(|e| GroupError::Data(e.to_string()))?;
        value
            .map(|v| serde_json::from_str(&v).map_err(|e| GroupError::Data(e.to_string())))
            .transpose()
    }

    pub fn len(&self) -> rusqlite::Result<usize> {
        let count: i64 = self.conn.query_row("SELECT count(*) FROM shelf", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> rusqlite::Result<bool> {
        Ok(self.len()? == 0)
    }
}
