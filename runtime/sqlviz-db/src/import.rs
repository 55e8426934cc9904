//! Chunked bulk import of column-oriented data.
//!
//! Rows are inserted through one prepared statement. Each chunk of rows runs
//! in its own transaction and is followed by a progress update, so progress
//! is only ever reported for committed data.

use crate::error::{Error, Result};
use crate::statement::Statement;
use crate::value::{ColumnData, Value};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 1500;

/// Out-of-band progress for one import, in percent.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// The caller's progress counter id.
    pub id: u64,
    pub progress: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub table: String,
    pub rows: usize,
    pub chunks: usize,
}

/// Partition of `[0, rows)` into consecutive chunks of at most `size` rows.
#[derive(Clone, Copy, Debug)]
pub struct ChunkPlan {
    rows: usize,
    size: usize,
}

impl ChunkPlan {
    /// A size of 0 is treated as 1.
    pub fn new(rows: usize, size: usize) -> Self {
        Self {
            rows,
            size: size.max(1),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.rows.div_ceil(self.size)
    }

    pub fn chunks(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.chunk_count()).map(move |idx| {
            let start = idx * self.size;
            start..(start + self.size).min(self.rows)
        })
    }

    /// Percentage reported once `completed` chunks are committed.
    pub fn progress_after(&self, completed: usize) -> f64 {
        match self.chunk_count() {
            0 => 100.0,
            total => 100.0 * completed as f64 / total as f64,
        }
    }
}

/// Double-quotes an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Storage type inferred from a column's first value.
pub fn column_type(first: Option<&Value>) -> &'static str {
    match first {
        Some(Value::Integer(_) | Value::Real(_)) => "REAL",
        Some(Value::Bool(_)) => "INTEGER",
        _ => "TEXT",
    }
}

pub fn create_table_sql(table: &str, data: &ColumnData) -> String {
    let columns: Vec<String> = data
        .columns
        .iter()
        .map(|name| {
            let first = data.values.get(name).and_then(|values| values.first());
            format!("{} {}", quote_ident(name), column_type(first))
        })
        .collect();
    format!("CREATE TABLE {}({});", quote_ident(table), columns.join(", "))
}

pub fn insert_sql(table: &str, columns: &[String]) -> String {
    let names: Vec<String> = columns.iter().map(|name| quote_ident(name)).collect();
    let params = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({});",
        quote_ident(table),
        names.join(", "),
        params
    )
}

fn row_values<'a>(data: &'a ColumnData, row: usize) -> Result<Vec<&'a Value>> {
    data.columns
        .iter()
        .map(|name| {
            data.values
                .get(name)
                .and_then(|values| values.get(row))
                .ok_or_else(|| {
                    Error::BindingType("tried to bind a value of an unknown type (undefined)".into())
                })
        })
        .collect()
}

fn insert_chunk(stmt: &mut Statement, data: &ColumnData, rows: Range<usize>) -> Result<()> {
    for row in rows {
        stmt.reset();
        stmt.bind_values(row_values(data, row)?)?;
        stmt.step()?;
    }
    stmt.reset();
    Ok(())
}

/// Creates `table` from `data` and fills it chunk by chunk.
///
/// A failing chunk is rolled back; chunks committed before it stay.
pub(crate) fn import_columns(
    conn: &Connection,
    table: &str,
    data: &ColumnData,
    counter: u64,
    chunk_size: usize,
    report: &mut dyn FnMut(ProgressUpdate),
) -> Result<ImportSummary> {
    let Some(first) = data.columns.first() else {
        return Err(Error::InvalidImport("no columns to import".to_string()));
    };
    if !data.values.contains_key(first) {
        return Err(Error::InvalidImport(format!("column {first} has no values")));
    }
    let plan = ChunkPlan::new(data.row_count(), chunk_size);
    conn.execute_batch(&create_table_sql(table, data))
        .map_err(|err| Error::Engine(sqlite_message(err)))?;

    let (stmt, _) = Statement::prepare(conn, &insert_sql(table, &data.columns))?;
    let mut stmt =
        stmt.ok_or_else(|| Error::Engine("import: insert statement is empty".to_string()))?;

    let total = plan.chunk_count();
    for (idx, rows) in plan.chunks().enumerate() {
        conn.execute_batch("BEGIN")?;
        let committed = insert_chunk(&mut stmt, data, rows.clone())
            .and_then(|()| conn.execute_batch("COMMIT").map_err(Error::from));
        if let Err(err) = committed {
            warn!(table, chunk = idx, rows = ?rows, error = %err, "import chunk rolled back");
            if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                debug!(error = %rollback, "rollback after failed chunk");
            }
            return Err(err);
        }
        let progress = plan.progress_after(idx + 1);
        debug!(table, chunk = idx, total, progress, "import chunk committed");
        report(ProgressUpdate {
            id: counter,
            progress,
        });
    }
    if total == 0 {
        report(ProgressUpdate {
            id: counter,
            progress: plan.progress_after(0),
        });
    }
    stmt.free();
    info!(table, rows = plan.rows, chunks = total, "import finished");
    Ok(ImportSummary {
        table: table.to_string(),
        rows: plan.rows,
        chunks: total,
    })
}

fn sqlite_message(err: rusqlite::Error) -> String {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => message,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ColumnData {
        ColumnData::new()
            .with_column("id", [1i64, 2, 3])
            .with_column("name", ["a", "b", "c"])
    }

    fn run(
        conn: &Connection,
        table: &str,
        data: &ColumnData,
        chunk_size: usize,
    ) -> (Result<ImportSummary>, Vec<f64>) {
        let mut seen = Vec::new();
        let result = import_columns(conn, table, data, 7, chunk_size, &mut |update: ProgressUpdate| {
            assert_eq!(update.id, 7);
            seen.push(update.progress);
        });
        (result, seen)
    }

    #[test]
    fn chunks_partition_every_row_once_in_order() {
        for rows in 0..40 {
            for size in 1..9 {
                let plan = ChunkPlan::new(rows, size);
                let flat: Vec<usize> = plan.chunks().flatten().collect();
                assert_eq!(flat, (0..rows).collect::<Vec<_>>());
                assert_eq!(plan.chunk_count(), rows.div_ceil(size));
                assert!(plan.chunks().all(|chunk| chunk.len() <= size));
            }
        }
        assert_eq!(ChunkPlan::new(3, 0).chunk_count(), 3);
    }

    #[test]
    fn ddl_and_dml_text() {
        let data = ColumnData::new()
            .with_column("n", [1.5f64])
            .with_column("flag", [true])
            .with_column("s", ["x"])
            .with_column("nothing", [Value::Null]);
        assert_eq!(
            create_table_sql("my \"t\"", &data),
            "CREATE TABLE \"my \"\"t\"\"\"(\"n\" REAL, \"flag\" INTEGER, \"s\" TEXT, \"nothing\" TEXT);"
        );
        assert_eq!(
            insert_sql("t", &data.columns),
            "INSERT INTO \"t\" (\"n\", \"flag\", \"s\", \"nothing\") VALUES (?, ?, ?, ?);"
        );
    }

    #[test]
    fn imports_in_chunks_and_reports_progress_after_each() {
        let conn = Connection::open_in_memory().expect("open");
        let (result, progress) = run(&conn, "t", &sample(), 2);
        let summary = result.expect("import");
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.chunks, 2);
        assert_eq!(progress.len(), 2);
        assert!((progress[0] - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(progress[1], 100.0);

        let mut stmt = conn.prepare("SELECT id, name FROM t ORDER BY rowid").expect("select");
        let rows: Vec<(f64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .expect("query")
            .collect::<rusqlite::Result<_>>()
            .expect("rows");
        assert_eq!(
            rows,
            vec![(1.0, "a".into()), (2.0, "b".into()), (3.0, "c".into())]
        );
    }

    #[test]
    fn zero_rows_creates_the_table_and_finishes_at_100() {
        let conn = Connection::open_in_memory().expect("open");
        let data = ColumnData::new().with_column("a", Vec::<i64>::new());
        let (result, progress) = run(&conn, "empty", &data, 10);
        assert_eq!(result.expect("import").chunks, 0);
        assert_eq!(progress, vec![100.0]);
        let count: i64 = conn
            .query_row("SELECT count(*) FROM empty", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn failing_chunk_rolls_back_but_earlier_chunks_stay() {
        let conn = Connection::open_in_memory().expect("open");
        let data = ColumnData::new()
            .with_column("a", [1i64, 2, 3, 4])
            .with_column("b", [1i64, 2, 3]);
        let (result, progress) = run(&conn, "t", &data, 2);
        let err = result.expect_err("short column");
        assert!(err.to_string().contains("unknown type (undefined)"), "{err}");
        assert_eq!(progress, vec![50.0]);
        let count: i64 = conn
            .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 2);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn existing_table_is_an_engine_error() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t(x)").expect("ddl");
        let (result, progress) = run(&conn, "t", &sample(), 2);
        let err = result.expect_err("duplicate table");
        assert!(err.to_string().contains("already exists"), "{err}");
        assert!(progress.is_empty());
    }

    #[test]
    fn input_without_columns_is_rejected() {
        let conn = Connection::open_in_memory().expect("open");
        let (result, _) = run(&conn, "t", &ColumnData::new(), 2);
        assert!(matches!(result, Err(Error::InvalidImport(_))));
    }
}
