//! The database session: one engine handle plus the statements and
//! functions bound to it.

use crate::engine::{VirtualFile, open_connection};
use crate::error::{Error, Result};
use crate::functions::{self, FunctionResult};
use crate::import::{self, ImportSummary, ProgressUpdate};
use crate::statement::{Statement, StatementId};
use crate::value::{ColumnData, ExecResult, Params, Value};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// Where a [`Session`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Open,
    Executing,
    Importing,
    Exporting,
    Closed,
}

#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    /// Parent directory for database files. Defaults to the system temp dir.
    pub scratch_dir: Option<PathBuf>,
}

/// Owner of the single engine handle.
///
/// Field order matters: statements are finalized before the connection is
/// dropped, and the connection is closed before its file is deleted.
pub struct Session {
    statements: BTreeMap<StatementId, Statement>,
    functions: BTreeMap<String, i32>,
    conn: Option<Connection>,
    file: Option<VirtualFile>,
    next_statement: u64,
    state: SessionState,
    config: SessionConfig,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            statements: BTreeMap::new(),
            functions: BTreeMap::new(),
            conn: None,
            file: None,
            next_statement: 1,
            state: SessionState::Uninitialized,
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Replaces any current database with `image`, or with a fresh empty one.
    pub fn open(&mut self, image: Option<&[u8]>) -> Result<()> {
        self.close_handle()?;
        if let Some(file) = self.file.take() {
            file.release()?;
        }
        let file = VirtualFile::create(self.config.scratch_dir.as_deref(), image)?;
        let conn = attach(&file)?;
        info!(
            path = %file.path().display(),
            bytes = image.map_or(0, <[u8]>::len),
            "database opened"
        );
        self.file = Some(file);
        self.conn = Some(conn);
        self.state = SessionState::Open;
        Ok(())
    }

    /// Closes and re-opens the handle on the same file. Data is kept;
    /// statements and user functions are not.
    pub fn reopen(&mut self) -> Result<()> {
        self.close_handle()?;
        let Some(file) = self.file.as_ref() else {
            return self.open(None);
        };
        self.conn = Some(attach(file)?);
        self.state = SessionState::Open;
        debug!("database reopened");
        Ok(())
    }

    /// Runs every statement in `sql`, binding `params` to each one.
    ///
    /// Statements that return rows contribute one column-oriented result
    /// each; other statements contribute nothing.
    pub fn exec(&mut self, sql: &str, params: Option<&Params>) -> Result<Vec<ExecResult>> {
        self.ensure_open()?;
        if sql.is_empty() {
            return Err(Error::MissingQuery);
        }
        self.transition(SessionState::Executing, |session| {
            let conn = session.connection()?;
            exec_all(conn, sql, params)
        })
    }

    /// Bulk-imports `data` into a new table `table`. See [`import::import_columns`].
    pub fn import(
        &mut self,
        table: &str,
        data: &ColumnData,
        counter: u64,
        chunk_size: usize,
        report: &mut dyn FnMut(ProgressUpdate),
    ) -> Result<ImportSummary> {
        self.ensure_open()?;
        self.transition(SessionState::Importing, |session| {
            let conn = session.connection()?;
            import::import_columns(conn, table, data, counter, chunk_size, report)
        })
    }

    /// Serializes the database and leaves the session open on the same data.
    pub fn export(&mut self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.state = SessionState::Exporting;
        let result = self.export_inner();
        self.state = if self.conn.is_some() {
            SessionState::Open
        } else {
            SessionState::Closed
        };
        result
    }

    fn export_inner(&mut self) -> Result<Vec<u8>> {
        self.close_handle()?;
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| Error::Engine("no database file to export".to_string()))?;
        let bytes = file.read()?;
        self.conn = Some(attach(file)?);
        info!(bytes = bytes.len(), "database exported");
        Ok(bytes)
    }

    /// Finalizes everything, closes the handle and deletes the file.
    pub fn close(&mut self) -> Result<()> {
        self.close_handle()?;
        if let Some(file) = self.file.take() {
            file.release()?;
        }
        self.state = SessionState::Closed;
        info!("database closed");
        Ok(())
    }

    /// Rows changed by the most recent write.
    pub fn rows_modified(&self) -> Result<u64> {
        Ok(self.connection()?.changes())
    }

    /// Registers a scalar function. Re-registering a name replaces it.
    pub fn register_function<F>(&mut self, name: &str, n_args: i32, func: F) -> Result<()>
    where
        F: Fn(&[Value]) -> FunctionResult + Send + 'static,
    {
        self.ensure_open()?;
        let conn = self.connection()?;
        if let Some(old_arity) = self.functions.get(name) {
            conn.remove_function(name, *old_arity)?;
        }
        functions::create_function(conn, name, n_args, func)?;
        self.functions.insert(name.to_string(), n_args);
        debug!(name, n_args, "function registered");
        Ok(())
    }

    /// Compiles the first statement of `sql` into the session's registry.
    pub fn prepare(&mut self, sql: &str) -> Result<StatementId> {
        self.ensure_open()?;
        let (stmt, _) = Statement::prepare(self.connection()?, sql)?;
        let stmt = stmt.ok_or_else(|| Error::Engine("prepare: no statement in query".to_string()))?;
        let id = StatementId(self.next_statement);
        self.next_statement += 1;
        self.statements.insert(id, stmt);
        Ok(id)
    }

    pub fn statement(&mut self, id: StatementId) -> Result<&mut Statement> {
        self.statements
            .get_mut(&id)
            .ok_or(Error::UnknownStatement(id.0))
    }

    /// Finalizes a registered statement.
    pub fn free_statement(&mut self, id: StatementId) -> Result<bool> {
        let stmt = self
            .statements
            .remove(&id)
            .ok_or(Error::UnknownStatement(id.0))?;
        Ok(stmt.free())
    }

    pub fn open_statements(&self) -> usize {
        self.statements.len()
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.conn.is_none() {
            self.open(None)?;
        }
        Ok(())
    }

    fn connection(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::Engine("database is not open".to_string()))
    }

    fn transition<T>(
        &mut self,
        state: SessionState,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.state = state;
        let result = body(self);
        self.state = SessionState::Open;
        result
    }

    /// Finalizes statements, drops user functions and closes the handle.
    fn close_handle(&mut self) -> Result<()> {
        let finalized = self.statements.len();
        for (_, stmt) in std::mem::take(&mut self.statements) {
            stmt.free();
        }
        let functions = std::mem::take(&mut self.functions);
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        for (name, arity) in &functions {
            conn.remove_function(name.as_str(), *arity)?;
        }
        conn.close().map_err(|(_, err)| Error::Sqlite(err))?;
        debug!(finalized, functions = functions.len(), "handle closed");
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

fn attach(file: &VirtualFile) -> Result<Connection> {
    let conn = open_connection(file.path())?;
    functions::register_baseline(&conn)?;
    Ok(conn)
}

fn exec_all(conn: &Connection, sql: &str, params: Option<&Params>) -> Result<Vec<ExecResult>> {
    let mut results = Vec::new();
    let mut rest = sql;
    while !rest.is_empty() {
        let (stmt, used) = Statement::prepare(conn, rest)?;
        rest = rest.get(used..).unwrap_or_default();
        let Some(mut stmt) = stmt else {
            if used == 0 {
                break;
            }
            continue;
        };
        if let Some(params) = params {
            stmt.bind(params)?;
        }
        let mut names: Option<Vec<String>> = None;
        let mut data: Vec<Vec<Value>> = Vec::new();
        while stmt.step()? {
            if names.is_none() {
                let declared = stmt.column_names();
                data = vec![Vec::new(); declared.len()];
                names = Some(declared);
            }
            for (column, value) in data.iter_mut().zip(stmt.get(None)?) {
                column.push(value);
            }
        }
        if let Some(names) = names {
            // A repeated column name keeps the values of its last occurrence.
            let values = names.iter().cloned().zip(data).collect();
            results.push(ExecResult {
                columns: names,
                values,
            });
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let mut session = Session::default();
        session.open(None).expect("open");
        session
    }

    #[test]
    fn multi_statement_exec_returns_one_result_per_select() {
        let mut session = session();
        let results = session
            .exec("SELECT 1 AS x; SELECT 2 AS y;", None)
            .expect("exec");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].columns, vec!["x".to_string()]);
        assert_eq!(results[0].column("x"), Some(&[Value::Integer(1)][..]));
        assert_eq!(results[1].columns, vec!["y".to_string()]);
        assert_eq!(results[1].column("y"), Some(&[Value::Integer(2)][..]));
    }

    #[test]
    fn writes_produce_no_result_entries() {
        let mut session = session();
        let results = session
            .exec(
                "CREATE TABLE t(a, b); INSERT INTO t VALUES (1, 'x'), (2, 'y'); SELECT b, a FROM t ORDER BY a;",
                None,
            )
            .expect("exec");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].columns, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(results[0].row_count(), 2);
        assert_eq!(session.rows_modified().expect("changes"), 2);
    }

    #[test]
    fn select_without_rows_yields_nothing() {
        let mut session = session();
        session.exec("CREATE TABLE t(a)", None).expect("ddl");
        assert!(session.exec("SELECT * FROM t", None).expect("select").is_empty());
    }

    #[test]
    fn params_bind_on_every_statement() {
        let mut session = session();
        let params = Params::named([(":v", 5i64)]);
        let results = session
            .exec("SELECT :v AS a; SELECT :v + 1 AS b", Some(&params))
            .expect("exec");
        assert_eq!(results[0].column("a"), Some(&[Value::Integer(5)][..]));
        assert_eq!(results[1].column("b"), Some(&[Value::Integer(6)][..]));
    }

    #[test]
    fn empty_query_is_rejected() {
        let mut session = session();
        let err = session.exec("", None).expect_err("empty");
        assert_eq!(err.to_string(), "exec: Missing query string");
    }

    #[test]
    fn exec_opens_a_fresh_database_implicitly() {
        let mut session = Session::default();
        assert_eq!(session.state(), SessionState::Uninitialized);
        let results = session.exec("SELECT 3 AS n", None).expect("exec");
        assert_eq!(results[0].column("n"), Some(&[Value::Integer(3)][..]));
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn engine_errors_surface_and_leave_the_session_open() {
        let mut session = session();
        let err = session.exec("SELECT * FROM missing", None).expect_err("no table");
        assert!(err.to_string().contains("no such table: missing"), "{err}");
        assert_eq!(session.state(), SessionState::Open);
        assert!(session.exec("SELECT 1", None).is_ok());
    }

    #[test]
    fn export_keeps_the_session_usable() {
        let mut session = session();
        session
            .exec("CREATE TABLE t(a); INSERT INTO t VALUES (42);", None)
            .expect("setup");
        let stmt = session.prepare("SELECT a FROM t").expect("prepare");
        let bytes = session.export().expect("export");
        assert!(bytes.starts_with(b"SQLite format 3\0"));
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.open_statements(), 0);
        assert!(matches!(session.statement(stmt), Err(Error::UnknownStatement(_))));
        let results = session.exec("SELECT a FROM t", None).expect("after export");
        assert_eq!(results[0].column("a"), Some(&[Value::Integer(42)][..]));
    }

    #[test]
    fn reopen_keeps_data_and_drops_user_functions() {
        let mut session = session();
        session
            .register_function("twice", 1, |args| {
                Ok(Value::Real(args[0].as_f64().unwrap_or(0.0) * 2.0))
            })
            .expect("register");
        session
            .exec("CREATE TABLE t(a); INSERT INTO t VALUES (twice(2));", None)
            .expect("use");
        session.reopen().expect("reopen");
        let results = session.exec("SELECT a FROM t", None).expect("select");
        assert_eq!(results[0].column("a"), Some(&[Value::Real(4.0)][..]));
        assert!(session.exec("SELECT twice(1)", None).is_err());
        assert!(session.exec("SELECT reverse('ab') AS r", None).is_ok());
    }

    #[test]
    fn registered_statements_are_addressed_by_id() {
        let mut session = session();
        let id = session.prepare("SELECT ? * 2").expect("prepare");
        let row = session
            .statement(id)
            .expect("stmt")
            .get(Some(&Params::Positional(vec![Value::Integer(21)])))
            .expect("get");
        assert_eq!(row, vec![Value::Integer(42)]);
        assert!(session.free_statement(id).expect("free"));
        assert!(session.free_statement(id).is_err());
    }

    #[test]
    fn close_then_exec_starts_over() {
        let mut session = session();
        session.exec("CREATE TABLE t(a)", None).expect("ddl");
        session.close().expect("close");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.exec("SELECT * FROM t", None).is_err());
        assert_eq!(session.state(), SessionState::Open);
    }
}
