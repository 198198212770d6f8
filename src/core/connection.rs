//! Database connections
//!
//! A [`Database`] owns one engine connection. Every operation re-checks that
//! the connection is still open; once [`Database::dispose`] has run, all
//! operations on it and on its statements fail with [`Error::Disposed`].
//!
//! # Concurrency
//!
//! The engine is opened in serialized mode, so a `Database` can be shared
//! across threads. Operations hold a shared gate for their duration and
//! disposal takes it exclusively, which means disposal waits for running
//! operations to finish. Callbacks running inside an operation (scalar
//! functions, commit filters) may issue further operations on the same
//! database but must not dispose it.

use super::config::OpenConfig;
use super::engine::{Bindings, CommitHook, Engine, RollbackHook, Target, UpdateHook};
use super::error::{Error, Result, SqlError};
use super::events::{
    self, CommitEvent, Event, EventHub, HookDemand, RollbackEvent, Subscription, UpdateEvent,
};
use super::function::{self, Aggregate, Arity};
use super::statement::{self, ResultSet, Statement};
use super::uri::{self, Location};
use super::value::Value;
use super::vfs::{LockLevel, MEMORY_VFS, PRIVATE_PREFIX, SHARED_PREFIX};
use ahash::RandomState;
use libsqlite3_sys as ffi;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

static NEXT_PRIVATE_STORE: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy)]
pub(crate) struct DbPtr(NonNull<ffi::sqlite3>);

// Connections are opened with SQLITE_OPEN_FULLMUTEX
unsafe impl Send for DbPtr {}
unsafe impl Sync for DbPtr {}

impl DbPtr {
    fn as_ptr(self) -> *mut ffi::sqlite3 {
        self.0.as_ptr()
    }
}

#[derive(Clone, Copy)]
pub(crate) struct StmtPtr(NonNull<ffi::sqlite3_stmt>);

unsafe impl Send for StmtPtr {}
unsafe impl Sync for StmtPtr {}

impl StmtPtr {
    pub(crate) fn new(raw: *mut ffi::sqlite3_stmt) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    fn as_ptr(self) -> *mut ffi::sqlite3_stmt {
        self.0.as_ptr()
    }
}

struct ConnectionState {
    db: Option<DbPtr>,
    statements: HashMap<u64, StmtPtr, RandomState>,
    next_statement: u64,
}

/// Shared core of a [`Database`], also referenced by its statements
pub(crate) struct Connection {
    engine: &'static Engine,
    gate: RwLock<()>,
    state: Mutex<ConnectionState>,
    hooks: Mutex<HookDemand>,
    events: Arc<EventHub>,
    file_name: String,
}

/// Build the error for a failed call from the connection's error state
///
/// # Safety
///
/// `db` must be a live connection of the engine behind `bindings`.
unsafe fn sql_error(bindings: &dyn Bindings, db: *mut ffi::sqlite3, rc: c_int) -> SqlError {
    let extended = bindings.extended_errcode(db);
    // the error state may belong to a later call when rc came from elsewhere
    let code = if extended & 0xff == rc & 0xff {
        extended
    } else {
        rc
    };
    SqlError::new(code, bindings.errmsg(db))
}

impl Connection {
    pub(crate) fn open(
        engine: &'static Engine,
        target: &str,
        config: &OpenConfig,
    ) -> Result<Arc<Self>> {
        let bindings = engine.bindings();
        let mut flags = config.open_flags();

        let (file_name, vfs) = match uri::resolve(target)? {
            Location::Memory { name, shared } => {
                let name = name.unwrap_or_else(|| "memory".to_string());
                let path = if shared {
                    format!("{}{}", SHARED_PREFIX, name)
                } else {
                    let id = NEXT_PRIVATE_STORE.fetch_add(1, Ordering::Relaxed);
                    format!("{}{}/{}", PRIVATE_PREFIX, id, name)
                };
                (path, MEMORY_VFS.to_string())
            }
            Location::Path(path) => (
                path.to_string_lossy().into_owned(),
                config
                    .vfs
                    .clone()
                    .unwrap_or_else(|| bindings.default_vfs().to_string()),
            ),
            Location::Uri { uri, vfs } => {
                flags |= ffi::SQLITE_OPEN_URI;
                let vfs = vfs
                    .or_else(|| config.vfs.clone())
                    .unwrap_or_else(|| bindings.default_vfs().to_string());
                (uri, vfs)
            }
        };

        if !bindings.permits_vfs(&vfs) {
            return Err(SqlError::new(
                ffi::SQLITE_CANTOPEN,
                format!("VFS {} is not available on the {:?} target", vfs, engine.target()),
            )
            .with_operation("opening")
            .into());
        }

        let c_name = CString::new(file_name.as_str())?;
        let c_vfs = CString::new(vfs.as_str())?;
        let mut raw = ptr::null_mut();
        let rc = unsafe { bindings.open(&c_name, flags, Some(&c_vfs), &mut raw) };
        if rc != ffi::SQLITE_OK {
            let err = if raw.is_null() {
                SqlError::new(rc, format!("unable to open {}", file_name))
            } else {
                unsafe {
                    let err = sql_error(bindings, raw, rc);
                    bindings.close(raw);
                    err
                }
            };
            return Err(err.with_operation("opening").into());
        }
        let db = NonNull::new(raw).map(DbPtr).ok_or_else(|| {
            SqlError::new(ffi::SQLITE_NOMEM, "engine returned no connection")
                .with_operation("opening")
        })?;

        let setup = unsafe {
            let mut rc = bindings.extended_result_codes(db.as_ptr(), config.extended_result_codes);
            if rc == ffi::SQLITE_OK {
                let ms = c_int::try_from(config.busy_timeout_ms).unwrap_or(c_int::MAX);
                rc = bindings.busy_timeout(db.as_ptr(), ms);
            }
            rc
        };
        if setup != ffi::SQLITE_OK {
            let err = unsafe {
                let err = sql_error(bindings, db.as_ptr(), setup);
                bindings.close(db.as_ptr());
                err
            };
            return Err(err.with_operation("configuring").into());
        }

        info!(
            "Opened {} via {} ({:?} target)",
            file_name,
            vfs,
            engine.target()
        );
        Ok(Arc::new(Self {
            engine,
            gate: RwLock::new(()),
            state: Mutex::new(ConnectionState {
                db: Some(db),
                statements: HashMap::default(),
                next_statement: 0,
            }),
            hooks: Mutex::new(HookDemand::default()),
            events: Arc::new(EventHub::with_capacity(config.event_capacity)),
            file_name,
        }))
    }

    pub(crate) fn engine(&self) -> &'static Engine {
        self.engine
    }

    pub(crate) fn bindings(&self) -> &'static dyn Bindings {
        self.engine.bindings()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state.lock().db.is_none()
    }

    /// Run `f` against the live connection handle
    pub(crate) fn with_db<T>(
        &self,
        f: impl FnOnce(&dyn Bindings, *mut ffi::sqlite3) -> Result<T>,
    ) -> Result<T> {
        let _gate = self.gate.read_recursive();
        let db = self.state.lock().db.ok_or(Error::Disposed)?;
        f(self.bindings(), db.as_ptr())
    }

    /// Run `f` against a registered statement handle
    pub(crate) fn with_statement<T>(
        &self,
        id: u64,
        f: impl FnOnce(&dyn Bindings, *mut ffi::sqlite3, *mut ffi::sqlite3_stmt) -> Result<T>,
    ) -> Result<T> {
        let _gate = self.gate.read_recursive();
        let (db, stmt) = {
            let state = self.state.lock();
            let db = state.db.ok_or(Error::Disposed)?;
            let stmt = *state
                .statements
                .get(&id)
                .ok_or(Error::StatementFinalized)?;
            (db, stmt)
        };
        f(self.bindings(), db.as_ptr(), stmt.as_ptr())
    }

    /// Map a result code to `Ok` or the connection's current error
    pub(crate) fn check(&self, db: *mut ffi::sqlite3, rc: c_int, operation: &str) -> Result<()> {
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(self.error(db, rc, operation))
        }
    }

    pub(crate) fn error(&self, db: *mut ffi::sqlite3, rc: c_int, operation: &str) -> Error {
        self.sql_error(db, rc).with_operation(operation).into()
    }

    pub(crate) fn sql_error(&self, db: *mut ffi::sqlite3, rc: c_int) -> SqlError {
        unsafe { sql_error(self.bindings(), db, rc) }
    }

    /// Take ownership of a freshly prepared handle
    pub(crate) fn register_statement(&self, stmt: StmtPtr) -> Result<u64> {
        let mut state = self.state.lock();
        if state.db.is_none() {
            drop(state);
            unsafe { self.bindings().finalize(stmt.as_ptr()) };
            return Err(Error::Disposed);
        }
        state.next_statement += 1;
        let id = state.next_statement;
        state.statements.insert(id, stmt);
        Ok(id)
    }

    /// Finalize a statement; a no-op when it is already gone
    pub(crate) fn finalize_statement(&self, id: u64) -> Result<()> {
        let _gate = self.gate.read_recursive();
        let Some(stmt) = self.state.lock().statements.remove(&id) else {
            return Ok(());
        };
        let rc = unsafe { self.bindings().finalize(stmt.as_ptr()) };
        // finalize repeats the last step error, which was already reported
        if rc != ffi::SQLITE_OK {
            debug!("Finalized statement {} after error code {}", id, rc);
        }
        Ok(())
    }

    pub(crate) fn subscribe<T: Event>(self: &Arc<Self>) -> Result<Subscription<T>> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let subscription = self.events.subscribe::<T>(Arc::downgrade(self));
        self.sync_hooks()?;
        Ok(subscription)
    }

    pub(crate) fn unsubscribe<T: Event>(&self, id: u64) {
        self.events.unsubscribe::<T>(id);
        match self.sync_hooks() {
            Ok(()) | Err(Error::Disposed) => {}
            Err(e) => warn!("Failed to update hooks after unsubscribe: {}", e),
        }
    }

    pub(crate) fn set_commit_filter(&self, filter: Option<events::CommitFilter>) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        self.events.set_commit_filter(filter);
        self.sync_hooks()
    }

    /// Install or remove engine hooks to match current demand
    fn sync_hooks(&self) -> Result<()> {
        self.with_db(|bindings, db| {
            let mut installed = self.hooks.lock();
            let demand = self.events.demand();
            let arg = Arc::as_ptr(&self.events) as *mut c_void;
            let arg_for = |on: bool| if on { arg } else { ptr::null_mut() };

            unsafe {
                if demand.update != installed.update {
                    let hook = demand.update.then_some(events::update_hook as UpdateHook);
                    bindings.update_hook(db, hook, arg_for(demand.update));
                }
                if demand.commit != installed.commit {
                    let hook = demand.commit.then_some(events::commit_hook as CommitHook);
                    bindings.commit_hook(db, hook, arg_for(demand.commit));
                }
                if demand.rollback != installed.rollback {
                    let hook = demand.rollback.then_some(events::rollback_hook as RollbackHook);
                    bindings.rollback_hook(db, hook, arg_for(demand.rollback));
                }
            }
            if *installed != demand {
                debug!("Engine hooks now {:?}", demand);
            }
            *installed = demand;
            Ok(())
        })
    }

    /// Close the connection; idempotent
    pub(crate) fn dispose(&self) -> Result<()> {
        let _gate = self.gate.write();
        let (db, statements) = {
            let mut state = self.state.lock();
            let Some(db) = state.db.take() else {
                return Ok(());
            };
            (db, std::mem::take(&mut state.statements))
        };
        let bindings = self.bindings();

        unsafe {
            let mut installed = self.hooks.lock();
            if installed.update {
                bindings.update_hook(db.as_ptr(), None, ptr::null_mut());
            }
            if installed.commit {
                bindings.commit_hook(db.as_ptr(), None, ptr::null_mut());
            }
            if installed.rollback {
                bindings.rollback_hook(db.as_ptr(), None, ptr::null_mut());
            }
            *installed = HookDemand::default();
        }
        self.events.close_all();

        let count = statements.len();
        for stmt in statements.into_values() {
            unsafe { bindings.finalize(stmt.as_ptr()) };
        }

        let rc = unsafe { bindings.close(db.as_ptr()) };
        if rc != ffi::SQLITE_OK {
            return Err(SqlError::new(rc, "failed to close connection")
                .with_operation("disposing")
                .into());
        }
        info!(
            "Disposed {} ({} statements finalized)",
            self.file_name, count
        );
        Ok(())
    }
}

/// An open database
///
/// # Examples
///
/// ```rust,no_run
/// use sqlbridge_rs::{params, Database};
///
/// # fn main() -> sqlbridge_rs::Result<()> {
/// let db = Database::open_in_memory()?;
/// db.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT)", &[])?;
/// db.execute("INSERT INTO t(name) VALUES (?)", params!["alpha"])?;
///
/// let rows = db.select("SELECT id, name FROM t", &[])?;
/// for row in rows.iter() {
///     let name: String = row.get(1)?;
///     println!("{}", name);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Database {
    inner: Arc<Connection>,
}

impl Database {
    /// Open `target` on the native engine
    ///
    /// `target` is a file path, `:memory:`, the empty string (private
    /// in-memory database) or a `file:` URI.
    pub fn open(target: &str) -> Result<Self> {
        Self::open_with_config(target, &OpenConfig::default())
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn open_with_config(target: &str, config: &OpenConfig) -> Result<Self> {
        let engine = Engine::load(config.target)?;
        Self::open_with_engine(engine, target, config)
    }

    /// Open through an explicitly loaded engine; `config.target` is ignored
    pub fn open_with_engine(
        engine: &'static Engine,
        target: &str,
        config: &OpenConfig,
    ) -> Result<Self> {
        Ok(Self {
            inner: Connection::open(engine, target, config)?,
        })
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.inner
    }

    pub fn engine(&self) -> &'static Engine {
        self.inner.engine()
    }

    pub fn target(&self) -> Target {
        self.inner.engine().target()
    }

    /// Name the database was opened under inside its VFS
    pub fn file_name(&self) -> &str {
        &self.inner.file_name
    }

    /// Run SQL, returning the number of rows changed by the last statement
    ///
    /// Without parameters, every statement in `sql` runs in order. With
    /// parameters, `sql` must contain exactly one statement.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        statement::execute(&self.inner, sql, params)
    }

    /// Run SQL and collect the rows of the last statement
    pub fn select(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        statement::select(&self.inner, sql, params, false)
    }

    /// Like [`Database::select`], also reporting each column's source table
    ///
    /// Fails with [`Error::FeatureUnavailable`] when the engine lacks column
    /// metadata.
    pub fn select_with_tables(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        self.engine().require_column_metadata()?;
        statement::select(&self.inner, sql, params, true)
    }

    /// Prepare the first statement in `sql`; the rest is left in its tail
    pub fn prepare(&self, sql: &str) -> Result<Statement> {
        self.prepare_with(sql, false)
    }

    /// Prepare `sql`, rejecting any statement after the first
    pub fn prepare_strict(&self, sql: &str) -> Result<Statement> {
        self.prepare_with(sql, true)
    }

    pub fn prepare_with(&self, sql: &str, strict: bool) -> Result<Statement> {
        statement::prepare_single(&self.inner, sql, strict)
    }

    /// Prepare every statement in `sql`, in order
    pub fn prepare_all(&self, sql: &str) -> Result<Vec<Statement>> {
        statement::prepare_all(&self.inner, sql)
    }

    /// Register a scalar function
    ///
    /// Registering the same name and arity again replaces the previous
    /// function. An error returned by `func` is raised as an SQL error.
    pub fn create_scalar_function<F>(
        &self,
        name: &str,
        arity: Arity,
        deterministic: bool,
        func: F,
    ) -> Result<()>
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        function::create_scalar(&self.inner, name, arity, deterministic, func)
    }

    /// Register an aggregate function; each group gets a fresh state
    pub fn create_aggregate_function<A: Aggregate>(
        &self,
        name: &str,
        arity: Arity,
        deterministic: bool,
        aggregate: A,
    ) -> Result<()> {
        function::create_aggregate(&self.inner, name, arity, deterministic, aggregate)
    }

    /// Stream of row changes
    pub fn subscribe_updates(&self) -> Result<Subscription<UpdateEvent>> {
        self.inner.subscribe()
    }

    pub fn subscribe_commits(&self) -> Result<Subscription<CommitEvent>> {
        self.inner.subscribe()
    }

    pub fn subscribe_rollbacks(&self) -> Result<Subscription<RollbackEvent>> {
        self.inner.subscribe()
    }

    /// Consult `filter` before every commit; returning `false` (or panicking)
    /// turns the commit into a rollback
    pub fn set_commit_filter<F>(&self, filter: F) -> Result<()>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.inner.set_commit_filter(Some(Arc::new(filter)))
    }

    pub fn clear_commit_filter(&self) -> Result<()> {
        self.inner.set_commit_filter(None)
    }

    pub fn last_insert_rowid(&self) -> Result<i64> {
        self.inner
            .with_db(|bindings, db| Ok(unsafe { bindings.last_insert_rowid(db) }))
    }

    /// Rows changed by the most recent INSERT, UPDATE or DELETE
    pub fn changes(&self) -> Result<usize> {
        self.inner
            .with_db(|bindings, db| Ok(unsafe { bindings.changes(db) }.max(0) as usize))
    }

    /// Whether no explicit transaction is open
    pub fn is_autocommit(&self) -> Result<bool> {
        self.inner
            .with_db(|bindings, db| Ok(unsafe { bindings.get_autocommit(db) }))
    }

    pub fn busy_timeout(&self, timeout: Duration) -> Result<()> {
        let ms = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);
        self.inner.with_db(|bindings, db| {
            let rc = unsafe { bindings.busy_timeout(db, ms) };
            self.inner.check(db, rc, "setting busy timeout")
        })
    }

    pub fn user_version(&self) -> Result<i64> {
        let rows = self.select("PRAGMA user_version", &[])?;
        match rows.row(0) {
            Some(row) => row.get(0),
            None => Ok(0),
        }
    }

    pub fn set_user_version(&self, version: i32) -> Result<()> {
        self.execute(&format!("PRAGMA user_version = {}", version), &[])?;
        Ok(())
    }

    /// Issue a file control against the file of `schema`
    ///
    /// # Safety
    ///
    /// `arg` must be valid for the opcode `op`.
    pub unsafe fn file_control(&self, schema: &str, op: c_int, arg: *mut c_void) -> Result<c_int> {
        let schema = CString::new(schema)?;
        self.inner
            .with_db(|bindings, db| Ok(bindings.file_control(db, &schema, op, arg)))
    }

    /// Lock level currently held on the main database file
    ///
    /// Available for databases opened through this crate's VFS implementations.
    pub fn lock_state(&self) -> Result<LockLevel> {
        let mut level: c_int = 0;
        let rc = unsafe {
            self.file_control(
                "main",
                ffi::SQLITE_FCNTL_LOCKSTATE,
                &mut level as *mut c_int as *mut c_void,
            )?
        };
        if rc != ffi::SQLITE_OK {
            return Err(SqlError::new(rc, "lock state is not reported by this VFS")
                .with_operation("file control")
                .into());
        }
        LockLevel::from_raw(level).ok_or_else(|| {
            Error::InvalidArgument(format!("VFS reported unknown lock level {}", level))
        })
    }

    /// Finalize all statements, close every event stream and close the
    /// connection. Later calls are no-ops.
    pub fn dispose(&self) -> Result<()> {
        self.inner.dispose()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.inner.dispose() {
            warn!("Failed to dispose {}: {}", self.inner.file_name, e);
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("file_name", &self.inner.file_name)
            .field("target", &self.target())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
