// ==============================================================================
// aggregator.rs - Result Aggregator
// ==============================================================================
// Description: Single consumer of group results: counters, printer, result DB
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use crossbeam_channel::Receiver;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::exporter::open_output;
use crate::group_worker::GroupResult;
use crate::models::{GroupKey, GroupValue};
use crate::store::{check_identifier, open_connection, table_columns, table_exists};

pub const RESULT_TABLE: &str = "results";

const MISSING: &str = "NA";

fn csv_error(e: csv::Error) -> PipelineError {
    PipelineError::Io(e.into())
}

fn sql_value(v: f64) -> Value {
    if v.is_nan() {
        Value::Null
    } else {
        Value::Real(v)
    }
}

/// Tab-delimited report of successful groups
pub struct ResultPrinter {
    writer: csv::Writer<Box<dyn Write>>,
}

impl ResultPrinter {
    /// Print to `path`; `-` is stdout
    pub fn create(path: &Path, group_by: &[String], fields: &[String]) -> PipelineResult<Self> {
        let sink: Box<dyn Write> = if path == Path::new("-") {
            Box::new(std::io::stdout())
        } else {
            open_output(path)?
        };
        Self::with_writer(sink, group_by, fields)
    }

    pub fn with_writer(sink: Box<dyn Write>, group_by: &[String], fields: &[String]) -> PipelineResult<Self> {
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(sink);
        let header: Vec<&str> = group_by
            .iter()
            .map(String::as_str)
            .chain(["sample_count", "variant_count"])
            .chain(fields.iter().map(String::as_str))
            .collect();
        writer.write_record(&header).map_err(csv_error)?;
        Ok(Self { writer })
    }

    pub fn print(&mut self, result: &GroupResult) -> PipelineResult<()> {
        let mut record: Vec<String> = result.key.values().iter().map(GroupValue::to_string).collect();
        record.push(result.sample_count.to_string());
        record.push(result.variant_count.to_string());
        record.extend(result.values.iter().map(|v| {
            if v.is_nan() {
                MISSING.to_string()
            } else {
                v.to_string()
            }
        }));
        self.writer.write_record(&record).map_err(csv_error)
    }

    pub fn finish(mut self) -> PipelineResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Result database with one row per group
pub struct ResultDb {
    conn: Connection,
    group_by: Vec<String>,
    fields: Vec<String>,
    interval: Duration,
    last_commit: Instant,
    recorded: usize,
}

impl ResultDb {
    /// Open or create the result table, adding any new result columns
    pub fn open(
        path: &Path,
        group_by: &[String],
        group_types: &[String],
        fields: &[String],
        busy_timeout: Duration,
        interval: Duration,
    ) -> PipelineResult<Self> {
        for name in group_by.iter().chain(fields) {
            check_identifier(name)?;
        }
        let conn = open_connection(path, busy_timeout)?;
        if !table_exists(&conn, "main", RESULT_TABLE)? {
            let mut columns: Vec<String> = group_by
                .iter()
                .zip(group_types)
                .map(|(name, ty)| format!("{} {}", name, ty))
                .collect();
            columns.push("sample_count INTEGER".to_string());
            columns.push("variant_count INTEGER".to_string());
            conn.execute_batch(&format!("CREATE TABLE {} ({});", RESULT_TABLE, columns.join(", ")))?;
        }
        let existing = table_columns(&conn, "main", RESULT_TABLE)?;
        for field in fields {
            if !existing.iter().any(|c| c.eq_ignore_ascii_case(field)) {
                debug!("Adding result column {}", field);
                conn.execute_batch(&format!("ALTER TABLE {} ADD {} REAL;", RESULT_TABLE, field))?;
            }
        }
        conn.execute_batch("BEGIN")?;
        Ok(Self {
            conn,
            group_by: group_by.to_vec(),
            fields: fields.to_vec(),
            interval,
            last_commit: Instant::now(),
            recorded: 0,
        })
    }

    /// Groups with every result field already computed
    pub fn computed_groups(path: &Path, group_by: &[String], fields: &[String], busy_timeout: Duration) -> PipelineResult<HashSet<GroupKey>> {
        if !path.exists() {
            return Ok(HashSet::new());
        }
        let conn = open_connection(path, busy_timeout)?;
        if !table_exists(&conn, "main", RESULT_TABLE)? {
            return Ok(HashSet::new());
        }
        let existing = table_columns(&conn, "main", RESULT_TABLE)?;
        let has = |c: &String| existing.iter().any(|e| e.eq_ignore_ascii_case(c));
        if !group_by.iter().chain(fields).all(has) {
            return Ok(HashSet::new());
        }
        let complete = fields
            .iter()
            .map(|f| format!("{} IS NOT NULL", f))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            group_by.join(", "),
            RESULT_TABLE,
            if complete.is_empty() { "1".to_string() } else { complete }
        );
        let mut stmt = conn.prepare(&sql)?;
        let groups = stmt
            .query_map([], |row| {
                (0..group_by.len())
                    .map(|i| row.get::<_, GroupValue>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map(GroupKey)
            })?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(groups)
    }

    /// Update the group's row, inserting it when absent
    pub fn record(&mut self, result: &GroupResult) -> rusqlite::Result<()> {
        let mut values: Vec<Value> = vec![
            Value::Integer(result.sample_count as i64),
            Value::Integer(result.variant_count as i64),
        ];
        values.extend(result.values.iter().map(|v| sql_value(*v)));

        let assignments: Vec<String> = ["sample_count", "variant_count"]
            .iter()
            .map(|s| s.to_string())
            .chain(self.fields.iter().cloned())
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c, i + 1))
            .collect();
        let offset = values.len();
        let condition = self
            .group_by
            .iter()
            .enumerate()
            .map(|(i, f)| format!("{} IS ?{}", f, offset + i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let mut params = values.clone();
        params.extend(result.key.values().iter().map(group_sql_value));
        let changed = self
            .conn
            .prepare_cached(&format!("UPDATE {} SET {} WHERE {}", RESULT_TABLE, assignments.join(", "), condition))?
            .execute(params_from_iter(params.iter()))?;

        if changed == 0 {
            let columns: Vec<&str> = self
                .group_by
                .iter()
                .map(String::as_str)
                .chain(["sample_count", "variant_count"])
                .chain(self.fields.iter().map(String::as_str))
                .collect();
            let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
            let mut row: Vec<Value> = result.key.values().iter().map(group_sql_value).collect();
            row.extend(values);
            self.conn
                .prepare_cached(&format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    RESULT_TABLE,
                    columns.join(", "),
                    placeholders.join(", ")
                ))?
                .execute(params_from_iter(row.iter()))?;
        }
        self.recorded += 1;

        if self.last_commit.elapsed() >= self.interval {
            self.conn.execute_batch("COMMIT; BEGIN")?;
            self.last_commit = Instant::now();
        }
        Ok(())
    }

    /// Commit and index the group columns
    pub fn finish(self) -> rusqlite::Result<usize> {
        self.conn.execute_batch("COMMIT")?;
        self.conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {0}_group ON {0} ({1});",
            RESULT_TABLE,
            self.group_by.join(", ")
        ))?;
        Ok(self.recorded)
    }
}

fn group_sql_value(v: &GroupValue) -> Value {
    match v {
        GroupValue::Null => Value::Null,
        GroupValue::Int(i) => Value::Integer(*i),
        GroupValue::Real(f) => Value::Real(*f),
        GroupValue::Text(s) => Value::Text(s.clone()),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateCounts {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct ResultAggregator {
    printer: Option<ResultPrinter>,
    db: Option<ResultDb>,
    counts: AggregateCounts,
}

impl ResultAggregator {
    pub fn new(printer: Option<ResultPrinter>, db: Option<ResultDb>) -> Self {
        Self {
            printer,
            db,
            counts: AggregateCounts::default(),
        }
    }

    pub fn counts(&self) -> AggregateCounts {
        self.counts
    }

    pub fn record(&mut self, result: &GroupResult) -> PipelineResult<()> {
        if result.is_failed() {
            self.counts.failed += 1;
        } else {
            self.counts.succeeded += 1;
            if let Some(printer) = self.printer.as_mut() {
                printer.print(result)?;
            }
        }
        if let Some(db) = self.db.as_mut() {
            db.record(result)?;
        }
        Ok(())
    }

    /// Consume results until every worker has hung up
    pub fn run(mut self, results: Receiver<GroupResult>, expected: usize) -> PipelineResult<AggregateCounts> {
        let progress_every = (expected / 10).max(1);
        let mut seen = 0usize;
        for result in results.iter() {
            self.record(&result)?;
            seen += 1;
            if seen % progress_every == 0 {
                info!("{} of {} groups done", seen, expected);
            }
        }
        if let Some(printer) = self.printer.take() {
            printer.finish()?;
        }
        if let Some(db) = self.db.take() {
            let recorded = db.finish()?;
            debug!("{} results recorded", recorded);
        }
        Ok(self.counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GroupError;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn result(gene: &str, values: Vec<f64>) -> GroupResult {
        GroupResult {
            key: GroupKey(vec![GroupValue::Text(gene.into())]),
            sample_count: 6,
            variant_count: 2,
            values,
            error: None,
        }
    }

    fn failed(gene: &str) -> GroupResult {
        GroupResult {
            error: Some(GroupError::NoVariants),
            sample_count: 0,
            variant_count: 0,
            ..result(gene, vec![f64::NAN, f64::NAN])
        }
    }

    #[test]
    fn test_counts_and_printed_rows() {
        let buf = SharedBuf::default();
        let fields = vec!["corr".to_string(), "t".to_string()];
        let printer = ResultPrinter::with_writer(Box::new(buf.clone()), &["gene".to_string()], &fields).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(result("A", vec![0.5, f64::NAN])).unwrap();
        tx.send(failed("B")).unwrap();
        tx.send(result("C", vec![-0.25, 1.5])).unwrap();
        drop(tx);

        let counts = ResultAggregator::new(Some(printer), None).run(rx, 3).unwrap();
        assert_eq!(counts, AggregateCounts { succeeded: 2, failed: 1 });
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "gene\tsample_count\tvariant_count\tcorr\tt");
        assert_eq!(lines[1], "A\t6\t2\t0.5\tNA");
        assert_eq!(lines[2], "C\t6\t2\t-0.25\t1.5");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_result_db_updates_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("res.DB");
        let group_by = vec!["gene".to_string()];
        let fields = vec!["corr".to_string()];
        let open = || {
            ResultDb::open(&path, &group_by, &["TEXT".to_string()], &fields, Duration::from_secs(1), Duration::from_secs(5))
                .unwrap()
        };

        let mut db = open();
        db.record(&result("A", vec![0.5])).unwrap();
        db.record(&failed("B")).unwrap();
        assert_eq!(db.finish().unwrap(), 2);

        let done = ResultDb::computed_groups(&path, &group_by, &fields, Duration::from_secs(1)).unwrap();
        assert_eq!(done.len(), 1);
        assert!(done.contains(&GroupKey(vec![GroupValue::Text("A".into())])));

        let mut db = open();
        db.record(&result("B", vec![0.75])).unwrap();
        db.finish().unwrap();

        let conn = Connection::open(&path).unwrap();
        let rows: i64 = conn.query_row("SELECT count(*) FROM results", [], |r| r.get(0)).unwrap();
        assert_eq!(rows, 2);
        let corr: f64 = conn
            .query_row("SELECT corr FROM results WHERE gene = 'B'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(corr, 0.75);

        // a new method adds its column; nothing is complete for it yet
        let more = vec!["corr".to_string(), "pvalue".to_string()];
        assert!(ResultDb::computed_groups(&path, &group_by, &more, Duration::from_secs(1))
            .unwrap()
            .is_empty());
    }
}
