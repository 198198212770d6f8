//! Storage backend contract
//!
//! The engine performs all durable I/O through a [`StorageBackend`] and the
//! [`StorageFile`] handles it opens. Backends report failures as [`VfsError`];
//! the bridge turns those into engine result codes so the engine's own
//! rollback logic can react.

use super::lock::LockLevel;
use libsqlite3_sys as ffi;
use std::os::raw::c_int;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("cannot open {0}")]
    CantOpen(String),

    #[error("file is read-only")]
    ReadOnly,

    #[error("invalid lock transition from {from:?} to {to:?}")]
    InvalidLockTransition { from: LockLevel, to: LockLevel },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VfsResult<T> = std::result::Result<T, VfsError>;

/// Access flags an engine file is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(c_int);

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_READONLY);
    pub const READ_WRITE: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_READWRITE);
    pub const CREATE: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_CREATE);
    pub const DELETE_ON_CLOSE: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_DELETEONCLOSE);
    pub const EXCLUSIVE: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_EXCLUSIVE);
    pub const MAIN_DB: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_MAIN_DB);
    pub const MAIN_JOURNAL: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_MAIN_JOURNAL);

    pub fn from_raw(flags: c_int) -> Self {
        OpenFlags(flags)
    }

    pub fn raw(self) -> c_int {
        self.0
    }

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_read_only(self) -> bool {
        !self.contains(Self::READ_WRITE)
    }

    pub fn create(self) -> bool {
        self.contains(Self::CREATE)
    }

    pub fn delete_on_close(self) -> bool {
        self.contains(Self::DELETE_ON_CLOSE)
    }

    pub fn exclusive(self) -> bool {
        self.contains(Self::EXCLUSIVE)
    }

    pub fn is_main_db(self) -> bool {
        self.contains(Self::MAIN_DB)
    }

    /// Same flags with read-write access downgraded to read-only
    pub fn downgraded(self) -> Self {
        OpenFlags((self.0 & !ffi::SQLITE_OPEN_READWRITE & !ffi::SQLITE_OPEN_CREATE) | ffi::SQLITE_OPEN_READONLY)
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Existence / permission query passed to [`StorageBackend::access`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCheck {
    Exists,
    ReadWrite,
    Read,
}

impl AccessCheck {
    pub fn from_raw(flag: c_int) -> Self {
        match flag {
            ffi::SQLITE_ACCESS_READWRITE => AccessCheck::ReadWrite,
            ffi::SQLITE_ACCESS_READ => AccessCheck::Read,
            _ => AccessCheck::Exists,
        }
    }
}

/// Sync request flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncFlags(c_int);

impl SyncFlags {
    pub fn from_raw(flags: c_int) -> Self {
        SyncFlags(flags)
    }

    pub fn data_only(self) -> bool {
        self.0 & ffi::SQLITE_SYNC_DATAONLY != 0
    }

    pub fn full(self) -> bool {
        self.0 & 0x0f == ffi::SQLITE_SYNC_FULL
    }
}

/// A named storage backend (one registered VFS)
pub trait StorageBackend: Send + Sync {
    /// Open `name`, or an anonymous temporary file when `name` is `None`
    fn open(&self, name: Option<&str>, flags: OpenFlags) -> VfsResult<Box<dyn StorageFile>>;

    /// Remove `name`; [`VfsError::NotFound`] when it does not exist
    fn delete(&self, name: &str, sync_dir: bool) -> VfsResult<()>;

    fn access(&self, name: &str, check: AccessCheck) -> VfsResult<bool>;

    /// Canonical form of `name`; equal names address the same storage object
    fn full_path_name(&self, name: &str) -> VfsResult<String>;
}

/// One open file of a [`StorageBackend`]
pub trait StorageFile: Send {
    /// Read into `buf` starting at `offset`, returning the bytes available.
    /// The bridge zero-fills the remainder of a short read.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> VfsResult<usize>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> VfsResult<()>;

    fn truncate(&mut self, size: u64) -> VfsResult<()>;

    fn sync(&mut self, flags: SyncFlags) -> VfsResult<()>;

    fn file_size(&self) -> VfsResult<u64>;

    /// Raise the lock; `Ok(false)` means another handle's lock blocks it
    fn lock(&mut self, level: LockLevel) -> VfsResult<bool>;

    fn unlock(&mut self, level: LockLevel) -> VfsResult<()>;

    fn check_reserved_lock(&self) -> VfsResult<bool>;

    fn lock_level(&self) -> LockLevel;

    fn is_read_only(&self) -> bool {
        false
    }

    fn sector_size(&self) -> c_int {
        4096
    }

    fn device_characteristics(&self) -> c_int {
        0
    }

    /// Release the handle; called exactly once before it is dropped
    fn close(&mut self) -> VfsResult<()> {
        Ok(())
    }
}
