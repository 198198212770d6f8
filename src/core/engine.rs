//! Engine entry-point table
//!
//! [`Bindings`] is the fixed table of engine calls every other layer goes
//! through. Both execution targets expose the same table: [`Native`] links the
//! engine into the process and may reach the host file system, [`Sandboxed`]
//! confines every database to the VFS backends registered by this crate.

use super::error::{Error, Result};
use super::vfs::{self, MemoryBackend, NativeBackend, Retention};
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;
use tracing::{debug, info};

/// Scalar function / aggregate step callback
pub type FunctionCallback =
    unsafe extern "C" fn(*mut ffi::sqlite3_context, c_int, *mut *mut ffi::sqlite3_value);
/// Aggregate finalize callback
pub type FinalCallback = unsafe extern "C" fn(*mut ffi::sqlite3_context);
/// Destructor for function user data
pub type DestroyCallback = unsafe extern "C" fn(*mut c_void);
/// Row-change hook
pub type UpdateHook =
    unsafe extern "C" fn(*mut c_void, c_int, *const c_char, *const c_char, ffi::sqlite3_int64);
/// Commit hook; non-zero turns the commit into a rollback
pub type CommitHook = unsafe extern "C" fn(*mut c_void) -> c_int;
/// Rollback hook
pub type RollbackHook = unsafe extern "C" fn(*mut c_void);

/// Execution target an engine instance runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// Engine linked into the process with host file-system access
    Native,
    /// Engine confined to in-process storage backends
    Sandboxed,
}

/// Optional engine features, detected once when the engine is loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// `sqlite3_column_table_name` and friends are compiled in
    pub column_metadata: bool,
    /// Engine was built thread-safe
    pub threadsafe: bool,
    /// Engine library version, e.g. `3.46.0`
    pub version: String,
}

/// The engine entry points.
///
/// Every method except the target policy hooks forwards to the engine with no
/// additional logic. Raw handles are passed through unchanged.
///
/// # Safety
///
/// All `unsafe` methods require that the handles passed in are live objects
/// obtained from the same engine and that the caller upholds the engine's
/// threading contract (no concurrent use of one connection).
pub trait Bindings: Send + Sync {
    fn target(&self) -> Target;

    /// VFS used when an open request names none
    fn default_vfs(&self) -> &'static str;

    /// Whether databases on this target may be opened through `vfs`
    fn permits_vfs(&self, _vfs: &str) -> bool {
        true
    }

    fn compile_option_used(&self, option: &CStr) -> bool {
        unsafe { ffi::sqlite3_compileoption_used(option.as_ptr()) != 0 }
    }

    fn threadsafe(&self) -> bool {
        unsafe { ffi::sqlite3_threadsafe() != 0 }
    }

    fn lib_version(&self) -> String {
        unsafe { CStr::from_ptr(ffi::sqlite3_libversion()) }
            .to_string_lossy()
            .into_owned()
    }

    unsafe fn open(
        &self,
        filename: &CStr,
        flags: c_int,
        vfs: Option<&CStr>,
        db: *mut *mut ffi::sqlite3,
    ) -> c_int {
        ffi::sqlite3_open_v2(
            filename.as_ptr(),
            db,
            flags,
            vfs.map_or(ptr::null(), CStr::as_ptr),
        )
    }

    unsafe fn close(&self, db: *mut ffi::sqlite3) -> c_int {
        ffi::sqlite3_close(db)
    }

    unsafe fn extended_result_codes(&self, db: *mut ffi::sqlite3, on: bool) -> c_int {
        ffi::sqlite3_extended_result_codes(db, on as c_int)
    }

    unsafe fn busy_timeout(&self, db: *mut ffi::sqlite3, ms: c_int) -> c_int {
        ffi::sqlite3_busy_timeout(db, ms)
    }

    unsafe fn errcode(&self, db: *mut ffi::sqlite3) -> c_int {
        ffi::sqlite3_errcode(db)
    }

    unsafe fn extended_errcode(&self, db: *mut ffi::sqlite3) -> c_int {
        ffi::sqlite3_extended_errcode(db)
    }

    unsafe fn errmsg(&self, db: *mut ffi::sqlite3) -> String {
        let msg = ffi::sqlite3_errmsg(db);
        if msg.is_null() {
            return String::new();
        }
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    }

    unsafe fn last_insert_rowid(&self, db: *mut ffi::sqlite3) -> i64 {
        ffi::sqlite3_last_insert_rowid(db)
    }

    unsafe fn changes(&self, db: *mut ffi::sqlite3) -> i64 {
        ffi::sqlite3_changes(db) as i64
    }

    unsafe fn get_autocommit(&self, db: *mut ffi::sqlite3) -> bool {
        ffi::sqlite3_get_autocommit(db) != 0
    }

    unsafe fn prepare(
        &self,
        db: *mut ffi::sqlite3,
        sql: *const c_char,
        len: c_int,
        stmt: *mut *mut ffi::sqlite3_stmt,
        tail: *mut *const c_char,
    ) -> c_int {
        ffi::sqlite3_prepare_v2(db, sql, len, stmt, tail)
    }

    unsafe fn step(&self, stmt: *mut ffi::sqlite3_stmt) -> c_int {
        ffi::sqlite3_step(stmt)
    }

    unsafe fn reset(&self, stmt: *mut ffi::sqlite3_stmt) -> c_int {
        ffi::sqlite3_reset(stmt)
    }

    unsafe fn finalize(&self, stmt: *mut ffi::sqlite3_stmt) -> c_int {
        ffi::sqlite3_finalize(stmt)
    }

    unsafe fn clear_bindings(&self, stmt: *mut ffi::sqlite3_stmt) -> c_int {
        ffi::sqlite3_clear_bindings(stmt)
    }

    unsafe fn stmt_readonly(&self, stmt: *mut ffi::sqlite3_stmt) -> bool {
        ffi::sqlite3_stmt_readonly(stmt) != 0
    }

    unsafe fn bind_parameter_count(&self, stmt: *mut ffi::sqlite3_stmt) -> c_int {
        ffi::sqlite3_bind_parameter_count(stmt)
    }

    unsafe fn bind_null(&self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> c_int {
        ffi::sqlite3_bind_null(stmt, index)
    }

    unsafe fn bind_int64(&self, stmt: *mut ffi::sqlite3_stmt, index: c_int, value: i64) -> c_int {
        ffi::sqlite3_bind_int64(stmt, index, value)
    }

    unsafe fn bind_double(&self, stmt: *mut ffi::sqlite3_stmt, index: c_int, value: f64) -> c_int {
        ffi::sqlite3_bind_double(stmt, index, value)
    }

    /// Binds a copy of `value`
    unsafe fn bind_text(&self, stmt: *mut ffi::sqlite3_stmt, index: c_int, value: &str) -> c_int {
        let Ok(len) = c_int::try_from(value.len()) else {
            return ffi::SQLITE_TOOBIG;
        };
        ffi::sqlite3_bind_text(
            stmt,
            index,
            value.as_ptr() as *const c_char,
            len,
            ffi::SQLITE_TRANSIENT(),
        )
    }

    /// Binds a copy of `value`; an empty slice binds a zero-length blob
    unsafe fn bind_blob(&self, stmt: *mut ffi::sqlite3_stmt, index: c_int, value: &[u8]) -> c_int {
        if value.is_empty() {
            return ffi::sqlite3_bind_zeroblob(stmt, index, 0);
        }
        let Ok(len) = c_int::try_from(value.len()) else {
            return ffi::SQLITE_TOOBIG;
        };
        ffi::sqlite3_bind_blob(
            stmt,
            index,
            value.as_ptr() as *const c_void,
            len,
            ffi::SQLITE_TRANSIENT(),
        )
    }

    unsafe fn column_count(&self, stmt: *mut ffi::sqlite3_stmt) -> c_int {
        ffi::sqlite3_column_count(stmt)
    }

    unsafe fn column_name(&self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> *const c_char {
        ffi::sqlite3_column_name(stmt, index)
    }

    /// Source table of a result column; only valid with column metadata
    unsafe fn column_table_name(
        &self,
        stmt: *mut ffi::sqlite3_stmt,
        index: c_int,
    ) -> *const c_char {
        ffi::sqlite3_column_table_name(stmt, index)
    }

    unsafe fn column_type(&self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> c_int {
        ffi::sqlite3_column_type(stmt, index)
    }

    unsafe fn column_int64(&self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> i64 {
        ffi::sqlite3_column_int64(stmt, index)
    }

    unsafe fn column_double(&self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> f64 {
        ffi::sqlite3_column_double(stmt, index)
    }

    unsafe fn column_text(&self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> *const u8 {
        ffi::sqlite3_column_text(stmt, index)
    }

    unsafe fn column_blob(&self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> *const u8 {
        ffi::sqlite3_column_blob(stmt, index) as *const u8
    }

    unsafe fn column_bytes(&self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> c_int {
        ffi::sqlite3_column_bytes(stmt, index)
    }

    unsafe fn value_type(&self, value: *mut ffi::sqlite3_value) -> c_int {
        ffi::sqlite3_value_type(value)
    }

    unsafe fn value_int64(&self, value: *mut ffi::sqlite3_value) -> i64 {
        ffi::sqlite3_value_int64(value)
    }

    unsafe fn value_double(&self, value: *mut ffi::sqlite3_value) -> f64 {
        ffi::sqlite3_value_double(value)
    }

    unsafe fn value_text(&self, value: *mut ffi::sqlite3_value) -> *const u8 {
        ffi::sqlite3_value_text(value)
    }

    unsafe fn value_blob(&self, value: *mut ffi::sqlite3_value) -> *const u8 {
        ffi::sqlite3_value_blob(value) as *const u8
    }

    unsafe fn value_bytes(&self, value: *mut ffi::sqlite3_value) -> c_int {
        ffi::sqlite3_value_bytes(value)
    }

    unsafe fn result_null(&self, ctx: *mut ffi::sqlite3_context) {
        ffi::sqlite3_result_null(ctx)
    }

    unsafe fn result_int64(&self, ctx: *mut ffi::sqlite3_context, value: i64) {
        ffi::sqlite3_result_int64(ctx, value)
    }

    unsafe fn result_double(&self, ctx: *mut ffi::sqlite3_context, value: f64) {
        ffi::sqlite3_result_double(ctx, value)
    }

    unsafe fn result_text(&self, ctx: *mut ffi::sqlite3_context, value: &str) {
        match c_int::try_from(value.len()) {
            Ok(len) => ffi::sqlite3_result_text(
                ctx,
                value.as_ptr() as *const c_char,
                len,
                ffi::SQLITE_TRANSIENT(),
            ),
            Err(_) => ffi::sqlite3_result_error_toobig(ctx),
        }
    }

    unsafe fn result_blob(&self, ctx: *mut ffi::sqlite3_context, value: &[u8]) {
        if value.is_empty() {
            return ffi::sqlite3_result_zeroblob(ctx, 0);
        }
        match c_int::try_from(value.len()) {
            Ok(len) => ffi::sqlite3_result_blob(
                ctx,
                value.as_ptr() as *const c_void,
                len,
                ffi::SQLITE_TRANSIENT(),
            ),
            Err(_) => ffi::sqlite3_result_error_toobig(ctx),
        }
    }

    unsafe fn result_error(&self, ctx: *mut ffi::sqlite3_context, message: &str) {
        let len = c_int::try_from(message.len()).unwrap_or(c_int::MAX);
        ffi::sqlite3_result_error(ctx, message.as_ptr() as *const c_char, len)
    }

    unsafe fn result_error_nomem(&self, ctx: *mut ffi::sqlite3_context) {
        ffi::sqlite3_result_error_nomem(ctx)
    }

    unsafe fn user_data(&self, ctx: *mut ffi::sqlite3_context) -> *mut c_void {
        ffi::sqlite3_user_data(ctx)
    }

    unsafe fn aggregate_context(&self, ctx: *mut ffi::sqlite3_context, bytes: c_int) -> *mut c_void {
        ffi::sqlite3_aggregate_context(ctx, bytes)
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn create_function(
        &self,
        db: *mut ffi::sqlite3,
        name: &CStr,
        n_arg: c_int,
        text_rep: c_int,
        app: *mut c_void,
        x_func: Option<FunctionCallback>,
        x_step: Option<FunctionCallback>,
        x_final: Option<FinalCallback>,
        x_destroy: Option<DestroyCallback>,
    ) -> c_int {
        ffi::sqlite3_create_function_v2(
            db,
            name.as_ptr(),
            n_arg,
            text_rep,
            app,
            x_func,
            x_step,
            x_final,
            x_destroy,
        )
    }

    unsafe fn update_hook(
        &self,
        db: *mut ffi::sqlite3,
        hook: Option<UpdateHook>,
        arg: *mut c_void,
    ) -> *mut c_void {
        ffi::sqlite3_update_hook(db, hook, arg)
    }

    unsafe fn commit_hook(
        &self,
        db: *mut ffi::sqlite3,
        hook: Option<CommitHook>,
        arg: *mut c_void,
    ) -> *mut c_void {
        ffi::sqlite3_commit_hook(db, hook, arg)
    }

    unsafe fn rollback_hook(
        &self,
        db: *mut ffi::sqlite3,
        hook: Option<RollbackHook>,
        arg: *mut c_void,
    ) -> *mut c_void {
        ffi::sqlite3_rollback_hook(db, hook, arg)
    }

    unsafe fn file_control(
        &self,
        db: *mut ffi::sqlite3,
        schema: &CStr,
        op: c_int,
        arg: *mut c_void,
    ) -> c_int {
        ffi::sqlite3_file_control(db, schema.as_ptr(), op, arg)
    }

    unsafe fn vfs_register(&self, vfs: *mut ffi::sqlite3_vfs, make_default: bool) -> c_int {
        ffi::sqlite3_vfs_register(vfs, make_default as c_int)
    }

    unsafe fn vfs_unregister(&self, vfs: *mut ffi::sqlite3_vfs) -> c_int {
        ffi::sqlite3_vfs_unregister(vfs)
    }

    unsafe fn vfs_find(&self, name: &CStr) -> *mut ffi::sqlite3_vfs {
        ffi::sqlite3_vfs_find(name.as_ptr())
    }
}

/// Engine linked into the host process
#[derive(Debug, Default)]
pub struct Native;

impl Bindings for Native {
    fn target(&self) -> Target {
        Target::Native
    }

    fn default_vfs(&self) -> &'static str {
        vfs::NATIVE_VFS
    }
}

/// Engine confined to this crate's in-process storage backends
#[derive(Debug, Default)]
pub struct Sandboxed;

impl Bindings for Sandboxed {
    fn target(&self) -> Target {
        Target::Sandboxed
    }

    fn default_vfs(&self) -> &'static str {
        vfs::SANDBOX_VFS
    }

    fn permits_vfs(&self, name: &str) -> bool {
        name != vfs::NATIVE_VFS && vfs::is_registered(name)
    }

    unsafe fn open(
        &self,
        filename: &CStr,
        flags: c_int,
        vfs: Option<&CStr>,
        db: *mut *mut ffi::sqlite3,
    ) -> c_int {
        let sandbox = CString::new(self.default_vfs()).unwrap_or_default();
        let vfs = vfs.unwrap_or(sandbox.as_c_str());
        if !self.permits_vfs(&vfs.to_string_lossy()) {
            *db = ptr::null_mut();
            return ffi::SQLITE_CANTOPEN;
        }
        ffi::sqlite3_open_v2(filename.as_ptr(), db, flags, vfs.as_ptr())
    }
}

/// A loaded engine: entry points plus the capabilities detected at load time
pub struct Engine {
    bindings: Box<dyn Bindings>,
    capabilities: Capabilities,
}

static NATIVE_ENGINE: Mutex<Option<&'static Engine>> = parking_lot::const_mutex(None);
static SANDBOXED_ENGINE: Mutex<Option<&'static Engine>> = parking_lot::const_mutex(None);

impl Engine {
    /// Load an engine for `target`, registering its storage backends
    ///
    /// Engines are process-wide; repeated loads return the same instance.
    pub fn load(target: Target) -> Result<&'static Engine> {
        let slot = match target {
            Target::Native => &NATIVE_ENGINE,
            Target::Sandboxed => &SANDBOXED_ENGINE,
        };
        let mut slot = slot.lock();
        if let Some(engine) = *slot {
            return Ok(engine);
        }

        let bindings: Box<dyn Bindings> = match target {
            Target::Native => Box::new(Native),
            Target::Sandboxed => Box::new(Sandboxed),
        };
        let engine: &'static Engine = Box::leak(Box::new(Engine::new(bindings)?));
        *slot = Some(engine);
        Ok(engine)
    }

    /// The engine for `target` if it has already been loaded
    ///
    /// Never waits: a load in progress on another thread reads as `None`.
    pub fn loaded(target: Target) -> Option<&'static Engine> {
        let slot = match target {
            Target::Native => &NATIVE_ENGINE,
            Target::Sandboxed => &SANDBOXED_ENGINE,
        };
        slot.try_lock().and_then(|slot| *slot)
    }

    /// Native engine with host file-system access
    pub fn native() -> Result<&'static Engine> {
        Self::load(Target::Native)
    }

    /// Wrap an entry-point table, probing capabilities and registering the
    /// backends its target needs
    pub fn new(bindings: Box<dyn Bindings>) -> Result<Self> {
        let capabilities = Capabilities {
            column_metadata: bindings.compile_option_used(c"ENABLE_COLUMN_METADATA"),
            threadsafe: bindings.threadsafe(),
            version: bindings.lib_version(),
        };
        debug!("Detected engine capabilities: {:?}", capabilities);

        vfs::ensure_registered(bindings.as_ref(), vfs::MEMORY_VFS, || {
            Arc::new(MemoryBackend::new(Retention::Release))
        })?;
        match bindings.target() {
            Target::Native => {
                vfs::ensure_registered(bindings.as_ref(), vfs::NATIVE_VFS, || {
                    Arc::new(NativeBackend::new())
                })?;
            }
            Target::Sandboxed => {
                vfs::ensure_registered(bindings.as_ref(), vfs::SANDBOX_VFS, || {
                    Arc::new(MemoryBackend::new(Retention::Retain))
                })?;
            }
        }

        info!(
            "Loaded {:?} engine (SQLite {})",
            bindings.target(),
            capabilities.version
        );
        Ok(Self {
            bindings,
            capabilities,
        })
    }

    pub fn target(&self) -> Target {
        self.bindings.target()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn bindings(&self) -> &dyn Bindings {
        self.bindings.as_ref()
    }

    /// Fail with [`Error::FeatureUnavailable`] unless column metadata is compiled in
    pub fn require_column_metadata(&self) -> Result<()> {
        if self.capabilities.column_metadata {
            Ok(())
        } else {
            Err(Error::FeatureUnavailable("column metadata"))
        }
    }

    /// Register a storage backend as a named VFS
    pub fn register_backend(
        &self,
        name: &str,
        backend: Arc<dyn vfs::StorageBackend>,
        make_default: bool,
    ) -> Result<()> {
        vfs::register(self.bindings(), name, backend, make_default)
    }

    /// Remove a VFS registered with [`Engine::register_backend`]
    pub fn unregister_backend(&self, name: &str) -> Result<()> {
        vfs::unregister(self.bindings(), name)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("target", &self.target())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
