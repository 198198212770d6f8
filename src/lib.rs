//! # sqlbridge - Embedded SQLite Binding with Pluggable Storage
//!
//! `sqlbridge-rs` exposes the SQLite engine to Rust applications on two
//! execution targets that behave identically:
//!
//! - **Native**: files live on the host file system, served by a positional
//!   I/O VFS
//! - **Sandboxed**: no host file-system access; databases live in an
//!   in-process storage emulation
//!
//! All durable I/O flows through the [`StorageBackend`] contract, so custom
//! backends can be registered as named VFSes. In-memory databases opened with
//! `cache=shared` are shared through the VFS lock protocol rather than the
//! engine's shared cache.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sqlbridge_rs::{params, Database, Result};
//!
//! # fn main() -> Result<()> {
//! let db = Database::open_in_memory()?;
//! db.execute("CREATE TABLE notes(id INTEGER PRIMARY KEY, body TEXT)", &[])?;
//! db.execute("INSERT INTO notes(body) VALUES (?)", params!["hello"])?;
//!
//! let rows = db.select("SELECT id, body FROM notes", &[])?;
//! for row in rows.iter() {
//!     let body: String = row.get_by_name("body")?;
//!     println!("{}", body);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Functions and Change Events
//!
//! ```rust,no_run
//! use sqlbridge_rs::{Arity, Database, Result, Value};
//!
//! # fn main() -> Result<()> {
//! let db = Database::open_in_memory()?;
//! db.create_scalar_function("double", Arity::Fixed(1), true, |args| {
//!     Ok(Value::Integer(args[0].get::<i64>()? * 2))
//! })?;
//!
//! let updates = db.subscribe_updates()?;
//! db.execute("CREATE TABLE t(x)", &[])?;
//! db.execute("INSERT INTO t VALUES (double(21))", &[])?;
//! for event in updates.drain() {
//!     println!("{:?} {} #{}", event.kind, event.table, event.rowid);
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    config::OpenConfig,
    connection::Database,
    engine::{Bindings, Capabilities, Engine, Target},
    error::{result_code_name, Error, Result, SqlError},
    events::{
        CommitEvent, RollbackEvent, Subscription, UpdateEvent, UpdateKind, DEFAULT_EVENT_CAPACITY,
    },
    function::{Aggregate, AggregateFn, Arity},
    statement::{Columns, ResultSet, Row, Rows, Statement},
    value::{FromValue, FromValueError, Value, ValueRef, ValueType},
    vfs::{
        AccessCheck, LockLevel, MemoryBackend, NativeBackend, OpenFlags, Retention,
        StorageBackend, StorageFile, SyncFlags, VfsError, VfsResult, MEMORY_VFS, NATIVE_VFS,
        SANDBOX_VFS,
    },
};

#[cfg(feature = "async")]
pub use crate::core::sandbox::{load_sandboxed, open_sandboxed, open_sandboxed_with_config};

use std::time::Duration;
use tracing::debug;

/// Builder for customizing how a database is opened
///
/// # Examples
///
/// ```rust,no_run
/// use sqlbridge_rs::{DatabaseBuilder, Target};
/// use std::time::Duration;
///
/// # fn main() -> sqlbridge_rs::Result<()> {
/// let db = DatabaseBuilder::new()
///     .path("app.db")
///     .target(Target::Sandboxed)
///     .busy_timeout(Duration::from_millis(250))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DatabaseBuilder {
    target_name: String,
    config: OpenConfig,
}

impl DatabaseBuilder {
    /// Create a builder for a private in-memory database
    pub fn new() -> Self {
        DatabaseBuilder {
            target_name: ":memory:".to_string(),
            config: OpenConfig::default(),
        }
    }

    /// Open a file path or `file:` URI
    pub fn path<S: Into<String>>(mut self, path: S) -> Self {
        self.target_name = path.into();
        self
    }

    /// Open an in-memory database; named shared ones are visible to every
    /// connection opened with the same name
    pub fn in_memory(mut self, name: Option<&str>, shared: bool) -> Self {
        self.target_name = match (name, shared) {
            (None, false) => ":memory:".to_string(),
            (name, shared) => format!(
                "file:{}?mode=memory{}",
                urlencoding::encode(name.unwrap_or("")),
                if shared { "&cache=shared" } else { "" }
            ),
        };
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.config.target = target;
        self
    }

    /// Open through a specific registered VFS
    pub fn vfs<S: Into<String>>(mut self, vfs: S) -> Self {
        self.config.vfs = Some(vfs.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.config.read_only = true;
        self
    }

    /// Fail instead of creating a missing database
    pub fn must_exist(mut self) -> Self {
        self.config.create = false;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.config.busy_timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        self
    }

    pub fn extended_result_codes(mut self, enabled: bool) -> Self {
        self.config.extended_result_codes = enabled;
        self
    }

    /// Events each subscription buffers before further ones are dropped
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Replace all settings with `config`
    pub fn config(mut self, config: OpenConfig) -> Self {
        self.config = config;
        self
    }

    /// Open the database
    ///
    /// A sandboxed target loads its engine synchronously on first use; with
    /// the `async` feature, [`DatabaseBuilder::build_async`] loads it off the
    /// executor instead.
    pub fn build(self) -> Result<Database> {
        debug!(
            "Building database {} with {:?}",
            self.target_name, self.config
        );
        Database::open_with_config(&self.target_name, &self.config)
    }

    /// Open the database, loading the sandboxed engine asynchronously
    #[cfg(feature = "async")]
    pub async fn build_async(self) -> Result<Database> {
        match self.config.target {
            Target::Sandboxed => open_sandboxed_with_config(&self.target_name, self.config).await,
            Target::Native => self.build(),
        }
    }
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_to_private_memory() -> Result<()> {
        let db = DatabaseBuilder::new().build()?;
        assert_eq!(db.target(), Target::Native);
        db.execute("CREATE TABLE t(x)", &[])?;
        Ok(())
    }

    #[test]
    fn test_builder_shared_memory() -> Result<()> {
        let a = DatabaseBuilder::new()
            .in_memory(Some("builder-shared"), true)
            .build()?;
        let b = DatabaseBuilder::new()
            .in_memory(Some("builder-shared"), true)
            .build()?;
        a.execute("CREATE TABLE t(x); INSERT INTO t VALUES (1)", &[])?;
        let rows = b.select("SELECT x FROM t", &[])?;
        assert_eq!(rows.len(), 1);
        Ok(())
    }

    #[test]
    fn test_builder_must_exist() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing.db");
        let result = DatabaseBuilder::new()
            .path(path.to_str().unwrap())
            .must_exist()
            .build();
        assert_eq!(result.unwrap_err().sql_code(), Some(libsqlite3_sys::SQLITE_CANTOPEN));
    }

    #[test]
    fn test_builder_from_config() -> Result<()> {
        let config = OpenConfig::from_toml("target = \"sandboxed\"\nbusy_timeout_ms = 10\n")?;
        let db = DatabaseBuilder::new().config(config).build()?;
        assert_eq!(db.target(), Target::Sandboxed);
        Ok(())
    }
}
