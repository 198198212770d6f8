//! Prepared statements and result rows
//!
//! A [`Statement`] wraps one compiled statement. It remembers the exact SQL it
//! was compiled from and the unconsumed tail that followed it, so multi
//! statement text can be prepared piecewise.
//!
//! Rows are read through a lending cursor ([`Rows`]): each [`Row`] borrows the
//! cursor and is invalidated by the next call to [`Rows::next`]. Copy values
//! out (or use [`Statement::select`]) to keep them.

use super::connection::{Connection, StmtPtr};
use super::error::{Error, Result};
use super::value::{self, FromValue, Value};
use ahash::RandomState;
use libsqlite3_sys as ffi;
use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::Arc;
use tracing::debug;

/// Result column names with by-name lookup
#[derive(Debug, Clone, Default)]
pub struct Columns {
    names: Vec<String>,
    index: HashMap<String, usize, RandomState>,
}

impl Columns {
    fn new(names: Vec<String>) -> Self {
        let mut index = HashMap::with_capacity_and_hasher(names.len(), RandomState::new());
        // last duplicate wins
        for (i, name) in names.iter().enumerate() {
            index.insert(name.clone(), i);
        }
        Self { names, index }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Index of a column by case-sensitive name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }
}

/// One result row
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a Columns,
    values: &'a [Value],
}

impl<'a> Row<'a> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Read column `index` (0-based) as `T`
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T> {
        self.get_ref(index)?
            .get()
            .map_err(value::column_error(index))
    }

    /// Read a column by name; with duplicate names the last column wins
    pub fn get_by_name<T: FromValue>(&self, name: &str) -> Result<T> {
        let index = self
            .columns
            .index_of(name)
            .ok_or_else(|| Error::InvalidColumnName(name.to_string()))?;
        self.get(index)
    }

    pub fn get_ref(&self, index: usize) -> Result<&'a Value> {
        self.values
            .get(index)
            .ok_or(Error::InvalidColumnIndex(index))
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    pub fn column_names(&self) -> &'a [String] {
        self.columns.names()
    }

    /// Copy the row out as `(column, value)` pairs
    pub fn to_map(&self) -> HashMap<String, Value, RandomState> {
        self.columns
            .names()
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

/// Fully materialized query result
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    columns: Arc<Columns>,
    rows: Vec<Vec<Value>>,
    tables: Option<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn column_names(&self) -> &[String] {
        self.columns.names()
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    /// Source table of each column, when requested with column metadata
    ///
    /// Expression columns have no source table.
    pub fn table_names(&self) -> Option<&[Option<String>]> {
        self.tables.as_deref()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<Row<'_>> {
        self.rows.get(index).map(|values| Row {
            columns: &self.columns,
            values,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Row<'_>> + '_ {
        self.rows.iter().map(move |values| Row {
            columns: &self.columns,
            values,
        })
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }
}

/// Single-pass cursor over the rows of a running statement
///
/// Dropping the cursor resets the statement.
pub struct Rows<'s> {
    statement: &'s mut Statement,
    current: Vec<Value>,
    done: bool,
}

impl<'s> Rows<'s> {
    /// Step to the next row; `None` once the statement completes
    ///
    /// After completion or an error every further call returns `None`.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Row<'_>>> {
        if self.done {
            return Ok(None);
        }
        match self.statement.step_into(&mut self.current) {
            Ok(true) => Ok(Some(Row {
                columns: &self.statement.columns,
                values: &self.current,
            })),
            Ok(false) => {
                self.done = true;
                Ok(None)
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    pub fn column_names(&self) -> &[String] {
        self.statement.columns.names()
    }
}

impl Drop for Rows<'_> {
    fn drop(&mut self) {
        self.statement.reset_quietly();
    }
}

/// A prepared statement
pub struct Statement {
    conn: Arc<Connection>,
    id: u64,
    sql: String,
    tail: String,
    tail_offset: usize,
    columns: Arc<Columns>,
    parameter_count: usize,
}

impl Statement {
    fn new(
        conn: &Arc<Connection>,
        stmt: StmtPtr,
        sql: &str,
        tail: &str,
        tail_offset: usize,
    ) -> Result<Self> {
        let id = conn.register_statement(stmt)?;
        let described = conn.with_statement(id, |bindings, _, stmt| unsafe {
            let count = bindings.column_count(stmt);
            let names: Vec<String> = (0..count)
                .map(|i| c_string(bindings.column_name(stmt, i)).unwrap_or_default())
                .collect();
            let parameters = bindings.bind_parameter_count(stmt).max(0) as usize;
            Ok((names, parameters))
        });
        let (names, parameter_count) = match described {
            Ok(described) => described,
            Err(e) => {
                conn.finalize_statement(id)?;
                return Err(e);
            }
        };

        debug!("Prepared statement {}: {}", id, sql);
        Ok(Self {
            conn: conn.clone(),
            id,
            sql: sql.to_string(),
            tail: tail.to_string(),
            tail_offset,
            columns: Arc::new(Columns::new(names)),
            parameter_count,
        })
    }

    fn fail(&self, db: *mut ffi::sqlite3, rc: c_int, operation: &str) -> Error {
        self.conn
            .sql_error(db, rc)
            .with_sql(self.sql.as_str())
            .with_operation(operation)
            .into()
    }

    /// SQL this statement was compiled from, byte for byte as it appeared in
    /// the input, including leading whitespace and skipped empty statements
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Text following this statement in the prepared input
    pub fn tail(&self) -> &str {
        &self.tail
    }

    /// Byte offset of [`Statement::tail`] within the prepared input
    pub fn tail_offset(&self) -> usize {
        self.tail_offset
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    pub fn column_names(&self) -> &[String] {
        self.columns.names()
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    /// Whether the statement leaves the database unchanged
    pub fn is_read_only(&self) -> Result<bool> {
        self.conn
            .with_statement(self.id, |bindings, _, stmt| Ok(unsafe { bindings.stmt_readonly(stmt) }))
    }

    /// Source table of each result column
    ///
    /// Fails with [`Error::FeatureUnavailable`] when the engine was built
    /// without column metadata.
    pub fn column_table_names(&self) -> Result<Vec<Option<String>>> {
        self.conn.engine().require_column_metadata()?;
        self.conn.with_statement(self.id, |bindings, _, stmt| unsafe {
            let count = bindings.column_count(stmt);
            Ok((0..count)
                .map(|i| c_string(bindings.column_table_name(stmt, i)))
                .collect())
        })
    }

    /// Rewind so the statement can run again; bindings are kept
    pub fn reset(&mut self) -> Result<()> {
        // reset repeats the last step error, which was already reported
        self.conn.with_statement(self.id, |bindings, _, stmt| {
            unsafe { bindings.reset(stmt) };
            Ok(())
        })
    }

    pub fn clear_bindings(&mut self) -> Result<()> {
        self.conn.with_statement(self.id, |bindings, db, stmt| {
            let rc = unsafe { bindings.clear_bindings(stmt) };
            if rc == ffi::SQLITE_OK {
                Ok(())
            } else {
                Err(self.fail(db, rc, "clearing bindings"))
            }
        })
    }

    fn reset_quietly(&self) {
        let _ = self.conn.with_statement(self.id, |bindings, _, stmt| {
            unsafe { bindings.reset(stmt) };
            Ok(())
        });
    }

    /// Reset and bind `params` positionally
    fn bind_all(&self, params: &[Value]) -> Result<()> {
        self.conn.with_statement(self.id, |bindings, db, stmt| unsafe {
            if params.len() != self.parameter_count {
                return Err(Error::InvalidArgument(format!(
                    "statement expects {} parameters, got {}",
                    self.parameter_count,
                    params.len()
                )));
            }
            bindings.reset(stmt);
            bindings.clear_bindings(stmt);
            for (i, param) in params.iter().enumerate() {
                let index = c_int::try_from(i + 1).map_err(|_| {
                    Error::InvalidArgument(format!("too many parameters: {}", params.len()))
                })?;
                let rc = value::bind(bindings, stmt, index, param);
                if rc != ffi::SQLITE_OK {
                    return Err(self.fail(db, rc, "binding"));
                }
            }
            Ok(())
        })
    }

    /// Step once, copying the row into `row`; false when done
    fn step_into(&self, row: &mut Vec<Value>) -> Result<bool> {
        self.conn
            .with_statement(self.id, |bindings, db, stmt| unsafe {
                match bindings.step(stmt) {
                    ffi::SQLITE_ROW => {
                        let count = bindings.column_count(stmt);
                        row.clear();
                        row.extend((0..count).map(|i| value::column(bindings, stmt, i).to_value()));
                        Ok(true)
                    }
                    ffi::SQLITE_DONE => Ok(false),
                    rc => Err(self.fail(db, rc, "stepping")),
                }
            })
    }

    /// Run to completion, returning the number of rows changed
    pub fn execute(&mut self, params: &[Value]) -> Result<usize> {
        self.bind_all(params)?;
        let result = self.conn.with_statement(self.id, |bindings, db, stmt| unsafe {
            loop {
                match bindings.step(stmt) {
                    ffi::SQLITE_ROW => continue,
                    ffi::SQLITE_DONE => break,
                    rc => return Err(self.fail(db, rc, "executing")),
                }
            }
            if bindings.stmt_readonly(stmt) {
                Ok(0)
            } else {
                Ok(bindings.changes(db).max(0) as usize)
            }
        });
        self.reset_quietly();
        result
    }

    /// Bind `params` and start a row cursor
    pub fn query(&mut self, params: &[Value]) -> Result<Rows<'_>> {
        self.bind_all(params)?;
        Ok(Rows {
            statement: self,
            current: Vec::new(),
            done: false,
        })
    }

    /// Run and collect every row
    pub fn select(&mut self, params: &[Value]) -> Result<ResultSet> {
        self.collect(params, false)
    }

    fn collect(&mut self, params: &[Value], with_tables: bool) -> Result<ResultSet> {
        let tables = if with_tables {
            Some(self.column_table_names()?)
        } else {
            None
        };
        let columns = self.columns.clone();
        let mut rows = Vec::new();
        let mut cursor = self.query(params)?;
        while let Some(row) = cursor.next()? {
            rows.push(row.values().to_vec());
        }
        Ok(ResultSet {
            columns,
            rows,
            tables,
        })
    }

    /// Release the compiled statement
    ///
    /// Later operations on this statement fail with
    /// [`Error::StatementFinalized`]; finalizing again is a no-op.
    pub fn finalize(&mut self) -> Result<()> {
        self.conn.finalize_statement(self.id)
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        let _ = self.conn.finalize_statement(self.id);
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("columns", &self.columns.names())
            .field("parameter_count", &self.parameter_count)
            .field("tail_offset", &self.tail_offset)
            .finish()
    }
}

/// Copy a nul-terminated engine string
///
/// # Safety
///
/// `ptr` must be null or point to a valid nul-terminated string.
unsafe fn c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

/// Output of compiling the first statement of some text
struct Compiled {
    stmt: Option<StmtPtr>,
    /// Bytes of input consumed, including a trailing `;`
    consumed: usize,
}

fn compile(conn: &Connection, sql: &str) -> Result<Compiled> {
    let len = c_int::try_from(sql.len())
        .map_err(|_| Error::InvalidArgument(format!("SQL text too long: {} bytes", sql.len())))?;
    conn.with_db(|bindings, db| {
        let start = sql.as_ptr() as *const c_char;
        let mut stmt = ptr::null_mut();
        let mut tail = ptr::null();
        let rc = unsafe { bindings.prepare(db, start, len, &mut stmt, &mut tail) };
        if rc != ffi::SQLITE_OK {
            return Err(conn
                .sql_error(db, rc)
                .with_sql(sql.trim())
                .with_operation("preparing")
                .into());
        }
        let consumed = if tail.is_null() {
            sql.len()
        } else {
            (tail as usize).saturating_sub(start as usize).min(sql.len())
        };
        if !sql.is_char_boundary(consumed) {
            if let Some(stmt) = StmtPtr::new(stmt) {
                conn.register_statement(stmt)
                    .and_then(|id| conn.finalize_statement(id))?;
            }
            return Err(Error::InvalidArgument(
                "statement boundary falls inside a character".to_string(),
            ));
        }
        Ok(Compiled {
            stmt: StmtPtr::new(stmt),
            consumed,
        })
    })
}

/// True when `sql` compiles to no statement (whitespace and comments only)
fn is_blank(conn: &Connection, sql: &str) -> Result<bool> {
    if sql.trim().is_empty() {
        return Ok(true);
    }
    match compile(conn, sql) {
        Ok(Compiled { stmt: None, .. }) => Ok(true),
        Ok(Compiled {
            stmt: Some(stmt), ..
        }) => {
            let id = conn.register_statement(stmt)?;
            conn.finalize_statement(id)?;
            Ok(false)
        }
        // text that does not compile is still trailing SQL
        Err(Error::Sql(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Prepare the first statement of `sql`
pub(crate) fn prepare_single(conn: &Arc<Connection>, sql: &str, strict: bool) -> Result<Statement> {
    let mut offset = 0;
    // skip empty statements such as a leading `;`
    let (stmt, end) = loop {
        let compiled = compile(conn, &sql[offset..])?;
        let end = offset + compiled.consumed;
        match compiled.stmt {
            Some(stmt) => break (stmt, end),
            None if compiled.consumed > 0 && end < sql.len() => offset = end,
            None => {
                return Err(Error::InvalidArgument(
                    "SQL contains no statement".to_string(),
                ))
            }
        }
    };
    let tail = &sql[end..];
    let statement = Statement::new(conn, stmt, &sql[offset..end], tail, end)?;

    if strict && !is_blank(conn, tail)? {
        return Err(Error::InvalidArgument(format!(
            "SQL contains more than one statement; trailing text at byte {}: {}",
            end,
            tail.trim()
        )));
    }
    Ok(statement)
}

/// Walk `sql` statement by statement, handing each compiled one to `f`
///
/// Each statement is compiled only after the previous one was handled, so
/// later statements may depend on schema changes made by earlier ones.
fn for_each_statement(
    conn: &Arc<Connection>,
    sql: &str,
    mut f: impl FnMut(Statement) -> Result<()>,
) -> Result<()> {
    let mut offset = 0;
    while offset < sql.len() {
        let rest = &sql[offset..];
        let compiled = compile(conn, rest)?;
        if compiled.consumed == 0 {
            break;
        }
        let end = offset + compiled.consumed;
        if let Some(stmt) = compiled.stmt {
            f(Statement::new(conn, stmt, &sql[offset..end], &sql[end..], end)?)?;
        }
        offset = end;
    }
    Ok(())
}

pub(crate) fn prepare_all(conn: &Arc<Connection>, sql: &str) -> Result<Vec<Statement>> {
    let mut statements = Vec::new();
    for_each_statement(conn, sql, |statement| {
        statements.push(statement);
        Ok(())
    })?;
    debug!("Prepared {} statements", statements.len());
    Ok(statements)
}

pub(crate) fn execute(conn: &Arc<Connection>, sql: &str, params: &[Value]) -> Result<usize> {
    if !params.is_empty() {
        return prepare_single(conn, sql, true)?.execute(params);
    }
    let mut changes = 0;
    for_each_statement(conn, sql, |mut statement| {
        changes = statement.execute(&[])?;
        Ok(())
    })?;
    Ok(changes)
}

pub(crate) fn select(
    conn: &Arc<Connection>,
    sql: &str,
    params: &[Value],
    with_tables: bool,
) -> Result<ResultSet> {
    if !params.is_empty() {
        return prepare_single(conn, sql, true)?.collect(params, with_tables);
    }
    let mut last = ResultSet::default();
    for_each_statement(conn, sql, |mut statement| {
        last = statement.collect(&[], with_tables)?;
        Ok(())
    })?;
    Ok(last)
}
