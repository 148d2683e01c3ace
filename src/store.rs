// ==============================================================================
// store.rs - SQLite Backing Store
// ==============================================================================
// Description: Project (variants, files, samples) and genotype databases
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Layout:
//   <name>.proj           metadata, filename, sample, variant, __asso_tmp
//   <name>_genotype.DB    genotype_<sample_id> (variant_id, GT, info...)
//
// Both files run in WAL mode so read-only connections held by loader and
// group worker threads are never blocked by a writer.
// ==============================================================================

use rusqlite::{params, params_from_iter, Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, PipelineResult};
use crate::format::FieldSpec;
use crate::index::VariantIndex;
use crate::models::{GenotypeRow, SampleId, VariantId, VariantIdentity};
use crate::writer::GenotypeSink;

/// Accept only plain SQL identifiers for user supplied names
pub fn check_identifier(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Identifier(name.to_string()))
    }
}

/// Open a read-write connection with the pipeline's pragmas
pub fn open_connection(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    // Note: execute_batch handles the rows PRAGMA journal_mode returns
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;",
    )?;
    Ok(conn)
}

/// Open a read-only connection
pub fn open_read_only(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

/// Run `op`, retrying up to `retries` times while the database is locked
pub fn retry_busy<T>(retries: u32, mut op: impl FnMut() -> rusqlite::Result<T>) -> rusqlite::Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if is_busy(&e) && attempt + 1 < retries => {
                attempt += 1;
                warn!("Database busy, retrying ({}/{})", attempt, retries);
                thread::sleep(Duration::from_millis(100 * attempt as u64));
            }
            other => return other,
        }
    }
}

/// Column names of a table (`schema` is e.g. "main" or an attached alias)
pub fn table_columns(conn: &Connection, schema: &str, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA {}.table_info({})", schema, table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Declared type of each named column
pub fn column_types(conn: &Connection, table: &str, columns: &[String]) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let declared: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns
        .iter()
        .map(|c| {
            declared
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(c))
                .map(|(_, ty)| if ty.is_empty() { "TEXT".to_string() } else { ty.clone() })
                .unwrap_or_else(|| "TEXT".to_string())
        })
        .collect())
}

pub fn table_exists(conn: &Connection, schema: &str, table: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        &format!("SELECT count(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?1", schema),
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn genotype_table(sample: SampleId) -> String {
    format!("genotype_{}", sample)
}

/// A row of the sample table
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub sample_id: SampleId,
    pub file_id: i64,
    pub name: Option<String>,
}

/// Project database: files, samples and the master variant table
pub struct ProjectStore {
    conn: Connection,
    info_fields: Vec<String>,
    insert_sql: String,
    update_sql: Option<String>,
}

impl ProjectStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> PipelineResult<Self> {
        let conn = open_connection(path, busy_timeout)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS filename (
                file_id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL UNIQUE,
                header TEXT,
                checksum TEXT,
                imported_at TEXT
            );
            CREATE TABLE IF NOT EXISTS sample (
                sample_id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL,
                sample_name TEXT
            );
            CREATE TABLE IF NOT EXISTS variant (
                variant_id INTEGER PRIMARY KEY,
                bin INTEGER,
                chr TEXT,
                pos INTEGER,
                ref TEXT,
                alt TEXT
            );
            CREATE INDEX IF NOT EXISTS variant_identity_index ON variant (chr, pos, ref, alt);",
        )?;
        let mut store = Self {
            conn,
            info_fields: Vec::new(),
            insert_sql: String::new(),
            update_sql: None,
        };
        store.prepare_variant_sql(Vec::new());
        Ok(store)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
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

    pub fn set_metadata(&self, key: &str, value: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn metadata(&self, key: &str) -> rusqlite::Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| row.get(0))
            .optional()
    }

    fn prepare_variant_sql(&mut self, info_fields: Vec<String>) {
        let mut columns = vec!["variant_id", "bin", "chr", "pos", "ref", "alt"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        columns.extend(info_fields.iter().cloned());
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        self.insert_sql = format!(
            "INSERT INTO variant ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        self.update_sql = if info_fields.is_empty() {
            None
        } else {
            let sets: Vec<String> = info_fields
                .iter()
                .enumerate()
                .map(|(i, f)| format!("{} = ?{}", f, i + 1))
                .collect();
            Some(format!(
                "UPDATE variant SET {} WHERE variant_id = ?{}",
                sets.join(", "),
                info_fields.len() + 1
            ))
        };
        self.info_fields = info_fields;
    }

    /// Add missing variant info columns and use them for later inserts
    pub fn ensure_variant_columns(&mut self, fields: &[FieldSpec]) -> PipelineResult<()> {
        let existing = table_columns(&self.conn, "main", "variant")?;
        for field in fields {
            check_identifier(&field.name)?;
            if !existing.iter().any(|c| c.eq_ignore_ascii_case(&field.name)) {
                info!("Adding field {} to variant table", field.name);
                self.conn.execute_batch(&format!(
                    "ALTER TABLE variant ADD {} {};",
                    field.name,
                    field.field_type.sql_type()
                ))?;
            }
        }
        self.prepare_variant_sql(fields.iter().map(|f| f.name.clone()).collect());
        Ok(())
    }

    pub fn load_variant_index(&self) -> PipelineResult<VariantIndex> {
        let mut stmt = self
            .conn
            .prepare("SELECT variant_id, chr, pos, ref, alt FROM variant")?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let pos: Option<i64> = row.get(2)?;
            Ok((
                VariantIdentity {
                    chr: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    pos: pos.unwrap_or_default() as u64,
                    ref_allele: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    alt_allele: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                },
                id as VariantId,
            ))
        })?;
        let stored = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        debug!("Loaded {} variants into the index", stored.len());
        Ok(VariantIndex::from_stored(stored))
    }

    pub fn insert_variant(
        &self,
        id: VariantId,
        bin: Option<u32>,
        identity: &VariantIdentity,
        info: &[Option<String>],
    ) -> rusqlite::Result<()> {
        let mut stmt = self.conn.prepare_cached(&self.insert_sql)?;
        let mut values: Vec<rusqlite::types::Value> = vec![
            (id as i64).into(),
            bin.map(i64::from).into(),
            identity.chr.clone().into(),
            (identity.pos as i64).into(),
            identity.ref_allele.clone().into(),
            identity.alt_allele.clone().into(),
        ];
        for idx in 0..self.info_fields.len() {
            values.push(info.get(idx).cloned().flatten().into());
        }
        stmt.execute(params_from_iter(values))?;
        Ok(())
    }

    pub fn update_variant_info(&self, id: VariantId, info: &[Option<String>]) -> rusqlite::Result<()> {
        let Some(sql) = &self.update_sql else {
            return Ok(());
        };
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut values: Vec<rusqlite::types::Value> = (0..self.info_fields.len())
            .map(|idx| info.get(idx).cloned().flatten().into())
            .collect();
        values.push((id as i64).into());
        stmt.execute(params_from_iter(values))?;
        Ok(())
    }

    pub fn find_file(&self, filename: &str) -> rusqlite::Result<Option<i64>> {
        self.conn
            .query_row("SELECT file_id FROM filename WHERE filename = ?1", [filename], |row| row.get(0))
            .optional()
    }

    pub fn record_file(&self, filename: &str, header: &str, checksum: &str) -> rusqlite::Result<i64> {
        self.conn.execute(
            "INSERT INTO filename (filename, header, checksum, imported_at) VALUES (?1, ?2, ?3, ?4)",
            params![filename, header, checksum, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_sample(&self, file_id: i64, name: Option<&str>) -> rusqlite::Result<SampleId> {
        self.conn.execute(
            "INSERT INTO sample (file_id, sample_name) VALUES (?1, ?2)",
            params![file_id, name],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn samples_of_file(&self, file_id: i64) -> rusqlite::Result<Vec<SampleId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT sample_id FROM sample WHERE file_id = ?1 ORDER BY sample_id")?;
        let ids = stmt
            .query_map([file_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Delete a file record and its samples, returning the removed sample ids
    pub fn remove_file(&self, file_id: i64) -> rusqlite::Result<Vec<SampleId>> {
        let samples = self.samples_of_file(file_id)?;
        self.conn.execute("DELETE FROM sample WHERE file_id = ?1", [file_id])?;
        self.conn.execute("DELETE FROM filename WHERE file_id = ?1", [file_id])?;
        Ok(samples)
    }

    pub fn samples(&self) -> rusqlite::Result<Vec<SampleRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT sample_id, file_id, sample_name FROM sample ORDER BY sample_id")?;
        let samples = stmt
            .query_map([], |row| {
                Ok(SampleRecord {
                    sample_id: row.get(0)?,
                    file_id: row.get(1)?,
                    name: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(samples)
    }

    pub fn variant_count(&self) -> rusqlite::Result<u64> {
        let count: i64 = self.conn.query_row("SELECT count(*) FROM variant", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// Genotype database with one table per sample
pub struct GenotypeStore {
    conn: Connection,
}

impl GenotypeStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Self> {
        Ok(Self {
            conn: open_connection(path, busy_timeout)?,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn create_table(&self, sample: SampleId, genotype: bool, info: &[FieldSpec]) -> rusqlite::Result<()> {
        let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (variant_id INT NOT NULL", genotype_table(sample));
        if genotype {
            sql.push_str(", GT INT");
        }
        for field in info {
            sql.push_str(&format!(", {} {}", field.name, field.field_type.sql_type()));
        }
        sql.push_str(");");
        self.conn.execute_batch(&sql)
    }

    pub fn drop_table(&self, sample: SampleId) -> rusqlite::Result<()> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {};", genotype_table(sample)))
    }

    pub fn has_index(&self, sample: SampleId) -> rusqlite::Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [format!("{}_index", genotype_table(sample))],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn create_index(&self, sample: SampleId) -> rusqlite::Result<()> {
        let table = genotype_table(sample);
        self.conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {0}_index ON {0} (variant_id ASC);",
            table
        ))
    }
}

impl GenotypeSink for GenotypeStore {
    fn write_batch(&mut self, sample: SampleId, rows: &[GenotypeRow]) -> rusqlite::Result<()> {
        let Some(first) = rows.first() else {
            return Ok(());
        };
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        let placeholders = vec!["?"; 1 + first.values.len()].join(", ");
        let mut stmt = self
            .conn
            .prepare_cached(&format!("INSERT INTO {} VALUES ({})", genotype_table(sample), placeholders))?;
        for row in rows {
            let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(1 + row.values.len());
            values.push((row.variant_id as i64).into());
            values.extend(row.values.iter().map(|v| v.clone().into()));
            stmt.execute(params_from_iter(values))?;
        }
        Ok(())
    }

    fn commit(&mut self) -> rusqlite::Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }
}
