//! File-system pass-through backend
//!
//! Databases opened on the native target live in ordinary host files. Each
//! file's handles in this process share one [`LockTable`]; the strongest lock
//! among them is mirrored onto the file as an [`AdvisoryLock`], which is what
//! other processes and other engine clients see. A request either side
//! refuses is reported as busy.

use super::advisory::AdvisoryLock;
use super::backend::{
    AccessCheck, OpenFlags, StorageBackend, StorageFile, SyncFlags, VfsError, VfsResult,
};
use super::lock::{LockLevel, LockRegistry, LockTable};
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use rand::Rng;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lock state this process keeps for one host file
#[derive(Debug)]
struct FileLocks {
    table: LockTable,
    os: AdvisoryLock,
    // traditional record locks die with any descriptor on the file, so closed
    // handles keep theirs open until the last handle goes
    parked: Vec<Arc<File>>,
}

impl FileLocks {
    fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            table: LockTable::new(),
            os: AdvisoryLock::open(path)?,
            parked: Vec::new(),
        })
    }
}

/// Backend reading and writing host files
#[derive(Debug, Default)]
pub struct NativeBackend {
    locks: Arc<LockRegistry<FileLocks>>,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files with live lock state
    pub fn tracked_files(&self) -> usize {
        self.locks.len()
    }
}

fn temp_path() -> PathBuf {
    let suffix: u64 = rand::thread_rng().gen();
    std::env::temp_dir().join(format!("sqlbridge-{:016x}.tmp", suffix))
}

/// Identity shared by every path naming the same file
#[cfg(unix)]
fn file_key(file: &File, _path: &Path) -> std::io::Result<String> {
    use std::os::unix::fs::MetadataExt;

    let metadata = file.metadata()?;
    Ok(format!("{}:{}", metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn file_key(_file: &File, path: &Path) -> std::io::Result<String> {
    Ok(path.to_string_lossy().into_owned())
}

fn open_file(path: &Path, flags: OpenFlags) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if !flags.is_read_only() {
        options.write(true);
        if flags.exclusive() && flags.create() {
            options.create_new(true);
        } else if flags.create() {
            options.create(true);
        }
    }
    options.open(path)
}

impl StorageBackend for NativeBackend {
    fn open(&self, name: Option<&str>, flags: OpenFlags) -> VfsResult<Box<dyn StorageFile>> {
        let (path, delete_on_close) = match name {
            Some(name) => (PathBuf::from(name), flags.delete_on_close()),
            None => (temp_path(), true),
        };

        let (file, read_only) = match open_file(&path, flags) {
            Ok(file) => (file, flags.is_read_only()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied && !flags.is_read_only() => {
                warn!("{} is not writable, opening read-only", path.display());
                (open_file(&path, flags.downgraded())?, true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(VfsError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let key = file_key(&file, &path)?;
        let locks = self.locks.attach_with(&key, || FileLocks::open(&path))?;
        debug!(
            "Opened native file {} as {} (read-only: {})",
            path.display(),
            key,
            read_only
        );

        Ok(Box::new(NativeFile {
            file: Arc::new(file),
            path,
            key,
            registry: self.locks.clone(),
            locks: Some(locks),
            held: LockLevel::None,
            read_only,
            delete_on_close,
        }))
    }

    fn delete(&self, name: &str, sync_dir: bool) -> VfsResult<()> {
        match fs::remove_file(name) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(VfsError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        #[cfg(unix)]
        if sync_dir {
            if let Some(parent) = Path::new(name).parent() {
                if let Ok(dir) = File::open(parent) {
                    dir.sync_all()?;
                }
            }
        }
        #[cfg(not(unix))]
        let _ = sync_dir;
        Ok(())
    }

    fn access(&self, name: &str, check: AccessCheck) -> VfsResult<bool> {
        let metadata = match fs::metadata(name) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        Ok(match check {
            // empty regular files (e.g. a truncated journal) count as absent
            AccessCheck::Exists => !metadata.is_file() || metadata.len() > 0,
            AccessCheck::Read => true,
            AccessCheck::ReadWrite => !metadata.permissions().readonly(),
        })
    }

    fn full_path_name(&self, name: &str) -> VfsResult<String> {
        let path = Path::new(name);
        if path.is_absolute() {
            return Ok(name.to_string());
        }
        Ok(std::env::current_dir()?.join(path).to_string_lossy().into_owned())
    }
}

/// Open host file plus the lock state shared with its siblings
#[derive(Debug)]
pub struct NativeFile {
    file: Arc<File>,
    path: PathBuf,
    key: String,
    registry: Arc<LockRegistry<FileLocks>>,
    locks: Option<Arc<Mutex<FileLocks>>>,
    held: LockLevel,
    read_only: bool,
    delete_on_close: bool,
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, data, offset)
}

#[cfg(windows)]
fn write_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, data, offset)
}

impl NativeFile {
    fn locks(&self) -> VfsResult<&Arc<Mutex<FileLocks>>> {
        self.locks
            .as_ref()
            .ok_or_else(|| VfsError::CantOpen(self.path.display().to_string()))
    }
}

impl StorageFile for NativeFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match read_at(&self.file, &mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> VfsResult<()> {
        if self.read_only {
            return Err(VfsError::ReadOnly);
        }
        let mut written = 0;
        while written < data.len() {
            match write_at(&self.file, &data[written..], offset + written as u64) {
                Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> VfsResult<()> {
        if self.read_only {
            return Err(VfsError::ReadOnly);
        }
        self.file.set_len(size)?;
        Ok(())
    }

    fn sync(&mut self, flags: SyncFlags) -> VfsResult<()> {
        if flags.data_only() {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn file_size(&self) -> VfsResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn lock(&mut self, level: LockLevel) -> VfsResult<bool> {
        let locks = self.locks()?.clone();
        let mut guard = locks.lock();
        let FileLocks { table, os, .. } = &mut *guard;

        let (saved, saved_held) = (*table, self.held);
        let granted = table.acquire(&mut self.held, level)?;
        let wanted = table.level();
        if wanted <= os.level() {
            return Ok(granted);
        }

        let reached = match os.raise(wanted) {
            Ok(reached) => reached,
            Err(e) => {
                *table = saved;
                self.held = saved_held;
                let _ = os.lower(table.level());
                return Err(e.into());
            }
        };
        if reached == wanted {
            return Ok(granted);
        }

        // another process holds a conflicting lock
        if reached >= LockLevel::Pending {
            table.fall_back_to_pending(&mut self.held);
        } else {
            *table = saved;
            self.held = saved_held;
        }
        os.lower(table.level())?;
        debug!(
            "Lock on {} refused outside this process at {:?}",
            self.key, reached
        );
        Ok(false)
    }

    fn unlock(&mut self, level: LockLevel) -> VfsResult<()> {
        let locks = self.locks()?.clone();
        let mut guard = locks.lock();
        let FileLocks { table, os, .. } = &mut *guard;
        table.release(&mut self.held, level)?;
        os.lower(table.level())?;
        Ok(())
    }

    fn check_reserved_lock(&self) -> VfsResult<bool> {
        let guard = self.locks()?.lock();
        Ok(guard.table.is_reserved() || guard.os.reserved_elsewhere()?)
    }

    fn lock_level(&self) -> LockLevel {
        self.held
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn device_characteristics(&self) -> c_int {
        ffi::SQLITE_IOCAP_POWERSAFE_OVERWRITE
    }

    fn close(&mut self) -> VfsResult<()> {
        let Some(locks) = self.locks.take() else {
            return Ok(());
        };
        let released = {
            let mut guard = locks.lock();
            let FileLocks { table, os, parked } = &mut *guard;
            if cfg!(all(unix, not(target_os = "linux"))) {
                parked.push(self.file.clone());
            }
            table
                .release(&mut self.held, LockLevel::None)
                .and_then(|()| os.lower(table.level()).map_err(VfsError::from))
        };
        self.registry.detach(&self.key, locks);
        released?;

        if self.delete_on_close {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for NativeFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
