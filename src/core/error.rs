//! Error types for binding operations
//!
//! Host-side misuse is reported immediately as [`Error::InvalidArgument`],
//! operations on disposed handles as [`Error::Disposed`], and every non-OK
//! result code observed from the engine as a structured [`SqlError`].

use libsqlite3_sys as ffi;
use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_int;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("database has been disposed")]
    Disposed,

    #[error("statement has been finalized")]
    StatementFinalized,

    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error("feature unavailable: {0} is not compiled into the engine")]
    FeatureUnavailable(&'static str),

    #[error("integer {0} does not fit the requested type")]
    IntegerOverflow(i128),

    #[error("column {index} has type {found}, expected {expected}")]
    InvalidColumnType {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("column index {0} out of range")]
    InvalidColumnIndex(usize),

    #[error("no such column: {0}")]
    InvalidColumnName(String),

    #[error("text is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("string contains an interior nul byte: {0}")]
    Nul(#[from] std::ffi::NulError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("VFS registration failed: {0}")]
    VfsRegistrationFailed(i32),

    #[error("VFS already registered: {0}")]
    VfsAlreadyRegistered(String),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    /// Primary engine result code, if this error came from the engine
    pub fn sql_code(&self) -> Option<i32> {
        match self {
            Error::Sql(e) => Some(e.code),
            _ => None,
        }
    }

    /// True for lock-contention failures (`SQLITE_BUSY` / `SQLITE_LOCKED`)
    pub fn is_busy(&self) -> bool {
        matches!(self.sql_code(), Some(ffi::SQLITE_BUSY) | Some(ffi::SQLITE_LOCKED))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Structured engine error: primary and extended code, message, explanation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    /// Primary result code (low byte of the extended code)
    pub code: i32,
    /// Extended result code
    pub extended_code: i32,
    /// Message reported by the engine for this connection
    pub message: String,
    /// Engine description of the extended code, suffixed with `(code N)`
    pub explanation: Option<String>,
    /// SQL text that was being compiled or executed
    pub sql: Option<String>,
    /// Binding operation that observed the failure
    pub operation: Option<String>,
}

impl SqlError {
    pub fn new(extended_code: i32, message: impl Into<String>) -> Self {
        Self {
            code: extended_code & 0xff,
            extended_code,
            message: message.into(),
            explanation: Some(explain(extended_code)),
            sql: None,
            operation: None,
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Symbolic name of the extended code, e.g. `SQLITE_CONSTRAINT_UNIQUE`
    pub fn code_name(&self) -> Option<&'static str> {
        result_code_name(self.extended_code)
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SqliteException({}): ", self.extended_code)?;
        if let Some(op) = &self.operation {
            write!(f, "while {}, ", op)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(explanation) = &self.explanation {
            write!(f, ", {}", explanation)?;
        }
        if let Some(sql) = &self.sql {
            write!(f, "\n  Causing statement: {}", sql)?;
        }
        Ok(())
    }
}

impl std::error::Error for SqlError {}

/// Engine text for a result code, e.g. `constraint failed (code 2067)`
pub fn explain(extended_code: c_int) -> String {
    // SAFETY: sqlite3_errstr returns a static nul-terminated string for any code
    let text = unsafe {
        let ptr = ffi::sqlite3_errstr(extended_code);
        if ptr.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    };
    format!("{} (code {})", text, extended_code)
}

/// Result codes as defined by the engine, reproduced verbatim
const RESULT_CODES: &[(i32, &str)] = &[
    (0, "SQLITE_OK"),
    (1, "SQLITE_ERROR"),
    (2, "SQLITE_INTERNAL"),
    (3, "SQLITE_PERM"),
    (4, "SQLITE_ABORT"),
    (5, "SQLITE_BUSY"),
    (6, "SQLITE_LOCKED"),
    (7, "SQLITE_NOMEM"),
    (8, "SQLITE_READONLY"),
    (9, "SQLITE_INTERRUPT"),
    (10, "SQLITE_IOERR"),
    (11, "SQLITE_CORRUPT"),
    (12, "SQLITE_NOTFOUND"),
    (13, "SQLITE_FULL"),
    (14, "SQLITE_CANTOPEN"),
    (15, "SQLITE_PROTOCOL"),
    (16, "SQLITE_EMPTY"),
    (17, "SQLITE_SCHEMA"),
    (18, "SQLITE_TOOBIG"),
    (19, "SQLITE_CONSTRAINT"),
    (20, "SQLITE_MISMATCH"),
    (21, "SQLITE_MISUSE"),
    (22, "SQLITE_NOLFS"),
    (23, "SQLITE_AUTH"),
    (24, "SQLITE_FORMAT"),
    (25, "SQLITE_RANGE"),
    (26, "SQLITE_NOTADB"),
    (27, "SQLITE_NOTICE"),
    (28, "SQLITE_WARNING"),
    (100, "SQLITE_ROW"),
    (101, "SQLITE_DONE"),
    (256, "SQLITE_OK_LOAD_PERMANENTLY"),
    (257, "SQLITE_ERROR_MISSING_COLLSEQ"),
    (261, "SQLITE_BUSY_RECOVERY"),
    (262, "SQLITE_LOCKED_SHAREDCACHE"),
    (264, "SQLITE_READONLY_RECOVERY"),
    (266, "SQLITE_IOERR_READ"),
    (267, "SQLITE_CORRUPT_VTAB"),
    (270, "SQLITE_CANTOPEN_NOTEMPDIR"),
    (275, "SQLITE_CONSTRAINT_CHECK"),
    (279, "SQLITE_AUTH_USER"),
    (283, "SQLITE_NOTICE_RECOVER_WAL"),
    (284, "SQLITE_WARNING_AUTOINDEX"),
    (512, "SQLITE_OK_SYMLINK"),
    (513, "SQLITE_ERROR_RETRY"),
    (516, "SQLITE_ABORT_ROLLBACK"),
    (517, "SQLITE_BUSY_SNAPSHOT"),
    (518, "SQLITE_LOCKED_VTAB"),
    (520, "SQLITE_READONLY_CANTLOCK"),
    (522, "SQLITE_IOERR_SHORT_READ"),
    (523, "SQLITE_CORRUPT_SEQUENCE"),
    (526, "SQLITE_CANTOPEN_ISDIR"),
    (531, "SQLITE_CONSTRAINT_COMMITHOOK"),
    (539, "SQLITE_NOTICE_RECOVER_ROLLBACK"),
    (769, "SQLITE_ERROR_SNAPSHOT"),
    (773, "SQLITE_BUSY_TIMEOUT"),
    (776, "SQLITE_READONLY_ROLLBACK"),
    (778, "SQLITE_IOERR_WRITE"),
    (779, "SQLITE_CORRUPT_INDEX"),
    (782, "SQLITE_CANTOPEN_FULLPATH"),
    (787, "SQLITE_CONSTRAINT_FOREIGNKEY"),
    (795, "SQLITE_NOTICE_RBU"),
    (1032, "SQLITE_READONLY_DBMOVED"),
    (1034, "SQLITE_IOERR_FSYNC"),
    (1038, "SQLITE_CANTOPEN_CONVPATH"),
    (1043, "SQLITE_CONSTRAINT_FUNCTION"),
    (1288, "SQLITE_READONLY_CANTINIT"),
    (1290, "SQLITE_IOERR_DIR_FSYNC"),
    (1294, "SQLITE_CANTOPEN_DIRTYWAL"),
    (1299, "SQLITE_CONSTRAINT_NOTNULL"),
    (1544, "SQLITE_READONLY_DIRECTORY"),
    (1546, "SQLITE_IOERR_TRUNCATE"),
    (1550, "SQLITE_CANTOPEN_SYMLINK"),
    (1555, "SQLITE_CONSTRAINT_PRIMARYKEY"),
    (1802, "SQLITE_IOERR_FSTAT"),
    (1811, "SQLITE_CONSTRAINT_TRIGGER"),
    (2058, "SQLITE_IOERR_UNLOCK"),
    (2067, "SQLITE_CONSTRAINT_UNIQUE"),
    (2314, "SQLITE_IOERR_RDLOCK"),
    (2323, "SQLITE_CONSTRAINT_VTAB"),
    (2570, "SQLITE_IOERR_DELETE"),
    (2579, "SQLITE_CONSTRAINT_ROWID"),
    (2826, "SQLITE_IOERR_BLOCKED"),
    (2835, "SQLITE_CONSTRAINT_PINNED"),
    (3082, "SQLITE_IOERR_NOMEM"),
    (3091, "SQLITE_CONSTRAINT_DATATYPE"),
    (3338, "SQLITE_IOERR_ACCESS"),
    (3594, "SQLITE_IOERR_CHECKRESERVEDLOCK"),
    (3850, "SQLITE_IOERR_LOCK"),
    (4106, "SQLITE_IOERR_CLOSE"),
    (4362, "SQLITE_IOERR_DIR_CLOSE"),
    (4618, "SQLITE_IOERR_SHMOPEN"),
    (4874, "SQLITE_IOERR_SHMSIZE"),
    (5130, "SQLITE_IOERR_SHMLOCK"),
    (5386, "SQLITE_IOERR_SHMMAP"),
    (5642, "SQLITE_IOERR_SEEK"),
    (5898, "SQLITE_IOERR_DELETE_NOENT"),
    (6154, "SQLITE_IOERR_MMAP"),
    (6410, "SQLITE_IOERR_GETTEMPPATH"),
    (6666, "SQLITE_IOERR_CONVPATH"),
    (6922, "SQLITE_IOERR_VNODE"),
    (7178, "SQLITE_IOERR_AUTH"),
    (7434, "SQLITE_IOERR_BEGIN_ATOMIC"),
    (7690, "SQLITE_IOERR_COMMIT_ATOMIC"),
    (7946, "SQLITE_IOERR_ROLLBACK_ATOMIC"),
    (8202, "SQLITE_IOERR_DATA"),
    (8458, "SQLITE_IOERR_CORRUPTFS"),
    (8714, "SQLITE_IOERR_IN_PAGE"),
];

/// Symbolic name for a primary or extended result code
pub fn result_code_name(code: i32) -> Option<&'static str> {
    RESULT_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}
