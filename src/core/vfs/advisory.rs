//! Advisory byte-range locks on host files
//!
//! Lock levels map onto the same bytes the engine's own unix VFS uses, one
//! gigabyte into the file, so other processes and other engine clients on
//! the same file see our locks and we see theirs:
//!
//! | level     | bytes held                                         |
//! |-----------|----------------------------------------------------|
//! | SHARED    | read lock on the shared range                      |
//! | RESERVED  | + write lock on the reserved byte                  |
//! | PENDING   | + write lock on the pending byte                   |
//! | EXCLUSIVE | + write lock on the shared range                   |
//!
//! On Linux the locks belong to the open file description (`F_OFD_SETLK`),
//! so they also conflict with traditional record locks taken elsewhere in
//! this process. Other Unix systems use traditional per-process locks.
//! Without Unix record locks only in-process coordination applies.

use super::lock::LockLevel;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

pub const PENDING_BYTE: u64 = 0x4000_0000;
pub const RESERVED_BYTE: u64 = PENDING_BYTE + 1;
pub const SHARED_FIRST: u64 = PENDING_BYTE + 2;
pub const SHARED_SIZE: u64 = 510;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Read,
    Write,
    Unlock,
}

/// The OS-visible lock one process holds on one file
#[derive(Debug)]
pub struct AdvisoryLock {
    file: File,
    level: LockLevel,
}

impl AdvisoryLock {
    /// Open a descriptor on `path` used only for locking
    pub fn open(path: &Path) -> io::Result<Self> {
        // write locks need a writable descriptor; read-only files never take them
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(_) => File::open(path)?,
        };
        Ok(Self {
            file,
            level: LockLevel::None,
        })
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Raise the lock towards `want`, one level at a time
    ///
    /// Returns the level reached, which is below `want` when another holder
    /// refuses a step. A refused EXCLUSIVE keeps PENDING so no new readers
    /// enter.
    pub fn raise(&mut self, want: LockLevel) -> io::Result<LockLevel> {
        if self.level == LockLevel::None && want >= LockLevel::Shared {
            // a writer holding the pending byte keeps new readers out
            if !set_lock(&self.file, Kind::Read, PENDING_BYTE, 1)? {
                return Ok(self.level);
            }
            let shared = set_lock(&self.file, Kind::Read, SHARED_FIRST, SHARED_SIZE);
            set_lock(&self.file, Kind::Unlock, PENDING_BYTE, 1)?;
            if !shared? {
                return Ok(self.level);
            }
            self.level = LockLevel::Shared;
        }
        if want >= LockLevel::Reserved && self.level < LockLevel::Reserved {
            if !set_lock(&self.file, Kind::Write, RESERVED_BYTE, 1)? {
                return Ok(self.level);
            }
            self.level = LockLevel::Reserved;
        }
        if want >= LockLevel::Pending && self.level < LockLevel::Pending {
            if !set_lock(&self.file, Kind::Write, PENDING_BYTE, 1)? {
                return Ok(self.level);
            }
            self.level = LockLevel::Pending;
        }
        if want == LockLevel::Exclusive && self.level < LockLevel::Exclusive {
            if !set_lock(&self.file, Kind::Write, SHARED_FIRST, SHARED_SIZE)? {
                return Ok(self.level);
            }
            self.level = LockLevel::Exclusive;
        }
        Ok(self.level)
    }

    /// Drop every byte held above `to`
    pub fn lower(&mut self, to: LockLevel) -> io::Result<()> {
        if to >= self.level {
            return Ok(());
        }
        if self.level == LockLevel::Exclusive && to >= LockLevel::Shared {
            set_lock(&self.file, Kind::Read, SHARED_FIRST, SHARED_SIZE)?;
        }
        if self.level >= LockLevel::Pending && to < LockLevel::Pending {
            set_lock(&self.file, Kind::Unlock, PENDING_BYTE, 1)?;
        }
        if self.level >= LockLevel::Reserved && to < LockLevel::Reserved {
            set_lock(&self.file, Kind::Unlock, RESERVED_BYTE, 1)?;
        }
        if to == LockLevel::None {
            set_lock(&self.file, Kind::Unlock, SHARED_FIRST, SHARED_SIZE)?;
        }
        self.level = to;
        Ok(())
    }

    /// True when a lock outside this descriptor holds the reserved byte
    pub fn reserved_elsewhere(&self) -> io::Result<bool> {
        if self.level >= LockLevel::Reserved {
            return Ok(false);
        }
        lock_held(&self.file, RESERVED_BYTE, 1)
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        let _ = self.lower(LockLevel::None);
    }
}

#[cfg(target_os = "linux")]
const SET_LOCK: libc::c_int = libc::F_OFD_SETLK;
#[cfg(target_os = "linux")]
const GET_LOCK: libc::c_int = libc::F_OFD_GETLK;
#[cfg(all(unix, not(target_os = "linux")))]
const SET_LOCK: libc::c_int = libc::F_SETLK;
#[cfg(all(unix, not(target_os = "linux")))]
const GET_LOCK: libc::c_int = libc::F_GETLK;

#[cfg(unix)]
fn flock(kind: Kind, start: u64, len: u64) -> io::Result<libc::flock> {
    let offset = |v: u64| {
        libc::off_t::try_from(v).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
    };
    // SAFETY: flock is plain data; l_pid must be zero for OFD locks
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = match kind {
        Kind::Read => libc::F_RDLCK,
        Kind::Write => libc::F_WRLCK,
        Kind::Unlock => libc::F_UNLCK,
    } as _;
    lock.l_whence = libc::SEEK_SET as _;
    lock.l_start = offset(start)?;
    lock.l_len = offset(len)?;
    Ok(lock)
}

/// Apply one lock change without waiting; `Ok(false)` means contention
#[cfg(unix)]
fn set_lock(file: &File, kind: Kind, start: u64, len: u64) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let lock = flock(kind, start, len)?;
    loop {
        // SAFETY: valid descriptor and a fully initialised flock
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), SET_LOCK, &lock as *const libc::flock) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) | Some(libc::EACCES) => return Ok(false),
            _ => return Err(err),
        }
    }
}

#[cfg(unix)]
fn lock_held(file: &File, start: u64, len: u64) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let mut lock = flock(Kind::Write, start, len)?;
    // SAFETY: valid descriptor; the kernel writes back into `lock`
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), GET_LOCK, &mut lock as *mut libc::flock) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(i32::from(lock.l_type) != libc::F_UNLCK as i32)
}

#[cfg(not(unix))]
fn set_lock(_file: &File, _kind: Kind, _start: u64, _len: u64) -> io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn lock_held(_file: &File, _start: u64, _len: u64) -> io::Result<bool> {
    Ok(false)
}
