//! Engine VFS bridge
//!
//! Exposes a [`StorageBackend`] to the engine as a named `sqlite3_vfs` and
//! routes the engine's file callbacks to the [`StorageFile`] handles it opens.
//! Backend errors become engine result codes here; panics raised by a backend
//! are contained and reported as I/O errors.

use super::backend::{AccessCheck, OpenFlags, StorageBackend, StorageFile, SyncFlags, VfsError};
use super::lock::LockLevel;
use crate::core::engine::Bindings;
use crate::core::error::{Error, Result};
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use rand::RngCore;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::{self, addr_of_mut};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Longest path name a bridged VFS accepts
const MAX_PATHNAME: c_int = 1024;

struct VfsAppData {
    backend: Arc<dyn StorageBackend>,
    name: CString,
}

/// Engine-visible file: the engine allocates `szOsFile` bytes and the bridge
/// initializes them as this struct
#[repr(C)]
struct BridgeFile {
    base: ffi::sqlite3_file,
    file: Option<Box<dyn StorageFile>>,
    name: Option<String>,
}

/// A live registration; owns the `sqlite3_vfs` and its app data
struct Registration {
    vfs: *mut ffi::sqlite3_vfs,
}

// The pointers are only dereferenced by the engine and under the registry lock
unsafe impl Send for Registration {}

static REGISTRY: Mutex<Vec<(String, Registration)>> = parking_lot::const_mutex(Vec::new());

// sqlite3_vfs objects must outlive every connection opened through them, so
// unregistered ones are parked here for the life of the process
static RETIRED: Mutex<Vec<Registration>> = parking_lot::const_mutex(Vec::new());

static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 1,
    xClose: Some(file_close),
    xRead: Some(file_read),
    xWrite: Some(file_write),
    xTruncate: Some(file_truncate),
    xSync: Some(file_sync),
    xFileSize: Some(file_size),
    xLock: Some(file_lock),
    xUnlock: Some(file_unlock),
    xCheckReservedLock: Some(file_check_reserved_lock),
    xFileControl: Some(file_control),
    xSectorSize: Some(file_sector_size),
    xDeviceCharacteristics: Some(file_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

/// True when `name` was registered through this module and not unregistered
pub fn is_registered(name: &str) -> bool {
    REGISTRY.lock().iter().any(|(n, _)| n == name)
}

/// Names of all VFSes registered through this module
pub fn registered_names() -> Vec<String> {
    REGISTRY.lock().iter().map(|(n, _)| n.clone()).collect()
}

/// Register `backend` under `name`
pub fn register(
    bindings: &dyn Bindings,
    name: &str,
    backend: Arc<dyn StorageBackend>,
    make_default: bool,
) -> Result<()> {
    let mut registry = REGISTRY.lock();
    register_locked(&mut registry, bindings, name, backend, make_default)
}

/// Register the backend built by `factory` unless `name` is already registered
pub fn ensure_registered(
    bindings: &dyn Bindings,
    name: &str,
    factory: impl FnOnce() -> Arc<dyn StorageBackend>,
) -> Result<()> {
    let mut registry = REGISTRY.lock();
    if registry.iter().any(|(n, _)| n == name) {
        return Ok(());
    }
    register_locked(&mut registry, bindings, name, factory(), false)
}

fn register_locked(
    registry: &mut Vec<(String, Registration)>,
    bindings: &dyn Bindings,
    name: &str,
    backend: Arc<dyn StorageBackend>,
    make_default: bool,
) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("VFS name must not be empty".into()));
    }
    if registry.iter().any(|(n, _)| n == name) {
        return Err(Error::VfsAlreadyRegistered(name.to_string()));
    }
    let c_name = CString::new(name)?;
    if !unsafe { bindings.vfs_find(&c_name) }.is_null() {
        return Err(Error::VfsAlreadyRegistered(name.to_string()));
    }

    let app_data = Box::into_raw(Box::new(VfsAppData {
        backend,
        name: c_name,
    }));

    let vfs = Box::into_raw(Box::new(ffi::sqlite3_vfs {
        iVersion: 2,
        szOsFile: std::mem::size_of::<BridgeFile>() as c_int,
        mxPathname: MAX_PATHNAME,
        pNext: ptr::null_mut(),
        zName: unsafe { (*app_data).name.as_ptr() },
        pAppData: app_data as *mut c_void,
        xOpen: Some(vfs_open),
        xDelete: Some(vfs_delete),
        xAccess: Some(vfs_access),
        xFullPathname: Some(vfs_full_pathname),
        xDlOpen: None,
        xDlError: None,
        xDlSym: None,
        xDlClose: None,
        xRandomness: Some(vfs_randomness),
        xSleep: Some(vfs_sleep),
        xCurrentTime: Some(vfs_current_time),
        xGetLastError: Some(vfs_get_last_error),
        xCurrentTimeInt64: Some(vfs_current_time_int64),
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    }));

    let rc = unsafe { bindings.vfs_register(vfs, make_default) };
    if rc != ffi::SQLITE_OK {
        unsafe {
            drop(Box::from_raw(vfs));
            drop(Box::from_raw(app_data));
        }
        return Err(Error::VfsRegistrationFailed(rc));
    }

    info!("Registered VFS {}", name);
    registry.push((name.to_string(), Registration { vfs }));
    Ok(())
}

/// Unregister a VFS registered through this module
///
/// Connections already open on it keep working; new opens fail.
pub fn unregister(bindings: &dyn Bindings, name: &str) -> Result<()> {
    if matches!(name, super::MEMORY_VFS | super::NATIVE_VFS | super::SANDBOX_VFS) {
        return Err(Error::InvalidArgument(format!(
            "{} is owned by the engine and cannot be unregistered",
            name
        )));
    }

    let mut registry = REGISTRY.lock();
    let Some(pos) = registry.iter().position(|(n, _)| n == name) else {
        return Err(Error::InvalidArgument(format!("no such VFS: {}", name)));
    };

    let rc = unsafe { bindings.vfs_unregister(registry[pos].1.vfs) };
    if rc != ffi::SQLITE_OK {
        return Err(Error::VfsRegistrationFailed(rc));
    }

    let (_, registration) = registry.remove(pos);
    RETIRED.lock().push(registration);
    info!("Unregistered VFS {}", name);
    Ok(())
}

unsafe fn app_data<'a>(vfs: *mut ffi::sqlite3_vfs) -> Option<&'a VfsAppData> {
    if vfs.is_null() {
        return None;
    }
    ((*vfs).pAppData as *const VfsAppData).as_ref()
}

unsafe fn name_arg<'a>(z_name: *const c_char) -> Option<&'a str> {
    if z_name.is_null() {
        return None;
    }
    CStr::from_ptr(z_name).to_str().ok()
}

/// Run `f`, turning a panic into `on_panic`
fn contain(on_panic: c_int, f: impl FnOnce() -> c_int) -> c_int {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        warn!("Storage backend panicked, reporting result code {}", on_panic);
        on_panic
    })
}

unsafe fn bridge_file<'a>(file: *mut ffi::sqlite3_file) -> Option<&'a mut Box<dyn StorageFile>> {
    (*(file as *mut BridgeFile)).file.as_mut()
}

// VFS callbacks

unsafe extern "C" fn vfs_open(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    let target = file as *mut BridgeFile;
    ptr::write(
        target,
        BridgeFile {
            base: ffi::sqlite3_file {
                pMethods: ptr::null(),
            },
            file: None,
            name: None,
        },
    );

    let Some(app) = app_data(vfs) else {
        return ffi::SQLITE_CANTOPEN;
    };
    let name = if z_name.is_null() {
        None
    } else {
        match name_arg(z_name) {
            Some(name) => Some(name),
            None => return ffi::SQLITE_CANTOPEN,
        }
    };
    let flags = OpenFlags::from_raw(flags);

    contain(ffi::SQLITE_CANTOPEN, || {
        match app.backend.open(name, flags) {
            Ok(opened) => {
                let out_flags = if opened.is_read_only() && !flags.is_read_only() {
                    flags.downgraded()
                } else {
                    flags
                };
                if !p_out_flags.is_null() {
                    *p_out_flags = out_flags.raw();
                }
                ptr::write(addr_of_mut!((*target).file), Some(opened));
                ptr::write(addr_of_mut!((*target).name), name.map(str::to_string));
                (*target).base.pMethods = &IO_METHODS;
                ffi::SQLITE_OK
            }
            Err(e) => {
                debug!(
                    "{}: open of {:?} failed: {}",
                    app.name.to_string_lossy(),
                    name,
                    e
                );
                ffi::SQLITE_CANTOPEN
            }
        }
    })
}

unsafe extern "C" fn vfs_delete(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    sync_dir: c_int,
) -> c_int {
    let (Some(app), Some(name)) = (app_data(vfs), name_arg(z_name)) else {
        return ffi::SQLITE_IOERR_DELETE;
    };
    contain(ffi::SQLITE_IOERR_DELETE, || {
        match app.backend.delete(name, sync_dir != 0) {
            Ok(()) => ffi::SQLITE_OK,
            Err(VfsError::NotFound(_)) => ffi::SQLITE_IOERR_DELETE_NOENT,
            Err(_) => ffi::SQLITE_IOERR_DELETE,
        }
    })
}

unsafe extern "C" fn vfs_access(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    flags: c_int,
    p_res_out: *mut c_int,
) -> c_int {
    let (Some(app), Some(name)) = (app_data(vfs), name_arg(z_name)) else {
        return ffi::SQLITE_IOERR_ACCESS;
    };
    contain(ffi::SQLITE_IOERR_ACCESS, || {
        match app.backend.access(name, AccessCheck::from_raw(flags)) {
            Ok(found) => {
                *p_res_out = found as c_int;
                ffi::SQLITE_OK
            }
            Err(_) => ffi::SQLITE_IOERR_ACCESS,
        }
    })
}

unsafe extern "C" fn vfs_full_pathname(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    n_out: c_int,
    z_out: *mut c_char,
) -> c_int {
    let (Some(app), Some(name)) = (app_data(vfs), name_arg(z_name)) else {
        return ffi::SQLITE_CANTOPEN;
    };
    contain(ffi::SQLITE_CANTOPEN, || {
        let Ok(full) = app.backend.full_path_name(name) else {
            return ffi::SQLITE_CANTOPEN;
        };
        let bytes = full.as_bytes();
        if bytes.len() >= n_out as usize || bytes.contains(&0) {
            return ffi::SQLITE_CANTOPEN;
        }
        ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, z_out, bytes.len());
        *z_out.add(bytes.len()) = 0;
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn vfs_randomness(
    _vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_out: *mut c_char,
) -> c_int {
    if n_byte <= 0 || z_out.is_null() {
        return 0;
    }
    let out = std::slice::from_raw_parts_mut(z_out as *mut u8, n_byte as usize);
    rand::thread_rng().fill_bytes(out);
    n_byte
}

unsafe extern "C" fn vfs_sleep(_vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    std::thread::sleep(std::time::Duration::from_micros(microseconds.max(0) as u64));
    microseconds
}

unsafe extern "C" fn vfs_current_time(_vfs: *mut ffi::sqlite3_vfs, p_time_out: *mut f64) -> c_int {
    use std::time::{SystemTime, UNIX_EPOCH};

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    // Julian day number
    *p_time_out = 2440587.5 + (duration.as_secs_f64() / 86400.0);
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_current_time_int64(
    _vfs: *mut ffi::sqlite3_vfs,
    p_time_out: *mut ffi::sqlite3_int64,
) -> c_int {
    use std::time::{SystemTime, UNIX_EPOCH};

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    // Julian day in milliseconds
    *p_time_out = 210866760000000i64 + (duration.as_millis() as i64);
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_get_last_error(
    _vfs: *mut ffi::sqlite3_vfs,
    _n_byte: c_int,
    _z_err_msg: *mut c_char,
) -> c_int {
    0
}

// File I/O methods

unsafe extern "C" fn file_close(file: *mut ffi::sqlite3_file) -> c_int {
    let target = file as *mut BridgeFile;
    let handle = ptr::replace(addr_of_mut!((*target).file), None);
    let name = ptr::replace(addr_of_mut!((*target).name), None);
    (*target).base.pMethods = ptr::null();

    let Some(mut handle) = handle else {
        return ffi::SQLITE_OK;
    };
    contain(ffi::SQLITE_IOERR_CLOSE, move || match handle.close() {
        Ok(()) => ffi::SQLITE_OK,
        Err(e) => {
            warn!("Close of {:?} failed: {}", name, e);
            ffi::SQLITE_IOERR_CLOSE
        }
    })
}

unsafe extern "C" fn file_read(
    file: *mut ffi::sqlite3_file,
    buf: *mut c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let Some(handle) = bridge_file(file) else {
        return ffi::SQLITE_IOERR_READ;
    };
    if offset < 0 || amt < 0 {
        return ffi::SQLITE_IOERR_READ;
    }
    let out = std::slice::from_raw_parts_mut(buf as *mut u8, amt as usize);

    contain(ffi::SQLITE_IOERR_READ, || match handle.read_at(offset as u64, out) {
        Ok(n) if n >= out.len() => ffi::SQLITE_OK,
        Ok(n) => {
            // The engine requires the unread tail to be zeroed
            out[n..].fill(0);
            ffi::SQLITE_IOERR_SHORT_READ
        }
        Err(_) => ffi::SQLITE_IOERR_READ,
    })
}

unsafe extern "C" fn file_write(
    file: *mut ffi::sqlite3_file,
    buf: *const c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let Some(handle) = bridge_file(file) else {
        return ffi::SQLITE_IOERR_WRITE;
    };
    if offset < 0 || amt < 0 {
        return ffi::SQLITE_IOERR_WRITE;
    }
    let data = std::slice::from_raw_parts(buf as *const u8, amt as usize);

    contain(ffi::SQLITE_IOERR_WRITE, || match handle.write_at(offset as u64, data) {
        Ok(()) => ffi::SQLITE_OK,
        Err(_) => ffi::SQLITE_IOERR_WRITE,
    })
}

unsafe extern "C" fn file_truncate(file: *mut ffi::sqlite3_file, size: ffi::sqlite3_int64) -> c_int {
    let Some(handle) = bridge_file(file) else {
        return ffi::SQLITE_IOERR_TRUNCATE;
    };
    if size < 0 {
        return ffi::SQLITE_IOERR_TRUNCATE;
    }
    contain(ffi::SQLITE_IOERR_TRUNCATE, || match handle.truncate(size as u64) {
        Ok(()) => ffi::SQLITE_OK,
        Err(_) => ffi::SQLITE_IOERR_TRUNCATE,
    })
}

unsafe extern "C" fn file_sync(file: *mut ffi::sqlite3_file, flags: c_int) -> c_int {
    let Some(handle) = bridge_file(file) else {
        return ffi::SQLITE_IOERR_FSYNC;
    };
    contain(ffi::SQLITE_IOERR_FSYNC, || {
        match handle.sync(SyncFlags::from_raw(flags)) {
            Ok(()) => ffi::SQLITE_OK,
            Err(_) => ffi::SQLITE_IOERR_FSYNC,
        }
    })
}

unsafe extern "C" fn file_size(file: *mut ffi::sqlite3_file, p_size: *mut ffi::sqlite3_int64) -> c_int {
    let Some(handle) = bridge_file(file) else {
        return ffi::SQLITE_IOERR_FSTAT;
    };
    contain(ffi::SQLITE_IOERR_FSTAT, || match handle.file_size() {
        Ok(size) => {
            *p_size = size as ffi::sqlite3_int64;
            ffi::SQLITE_OK
        }
        Err(_) => ffi::SQLITE_IOERR_FSTAT,
    })
}

unsafe extern "C" fn file_lock(file: *mut ffi::sqlite3_file, level: c_int) -> c_int {
    let (Some(handle), Some(level)) = (bridge_file(file), LockLevel::from_raw(level)) else {
        return ffi::SQLITE_IOERR_LOCK;
    };
    contain(ffi::SQLITE_IOERR_LOCK, || match handle.lock(level) {
        Ok(true) => ffi::SQLITE_OK,
        Ok(false) => ffi::SQLITE_BUSY,
        Err(_) => ffi::SQLITE_IOERR_LOCK,
    })
}

unsafe extern "C" fn file_unlock(file: *mut ffi::sqlite3_file, level: c_int) -> c_int {
    let (Some(handle), Some(level)) = (bridge_file(file), LockLevel::from_raw(level)) else {
        return ffi::SQLITE_IOERR_UNLOCK;
    };
    contain(ffi::SQLITE_IOERR_UNLOCK, || match handle.unlock(level) {
        Ok(()) => ffi::SQLITE_OK,
        Err(_) => ffi::SQLITE_IOERR_UNLOCK,
    })
}

unsafe extern "C" fn file_check_reserved_lock(
    file: *mut ffi::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    let Some(handle) = bridge_file(file) else {
        return ffi::SQLITE_IOERR_CHECKRESERVEDLOCK;
    };
    contain(ffi::SQLITE_IOERR_CHECKRESERVEDLOCK, || {
        match handle.check_reserved_lock() {
            Ok(reserved) => {
                *p_res_out = reserved as c_int;
                ffi::SQLITE_OK
            }
            Err(_) => ffi::SQLITE_IOERR_CHECKRESERVEDLOCK,
        }
    })
}

unsafe extern "C" fn file_control(
    file: *mut ffi::sqlite3_file,
    op: c_int,
    p_arg: *mut c_void,
) -> c_int {
    match op {
        ffi::SQLITE_FCNTL_LOCKSTATE => {
            let Some(handle) = bridge_file(file) else {
                return ffi::SQLITE_NOTFOUND;
            };
            if !p_arg.is_null() {
                *(p_arg as *mut c_int) = handle.lock_level().as_raw();
            }
            ffi::SQLITE_OK
        }
        _ => ffi::SQLITE_NOTFOUND,
    }
}

unsafe extern "C" fn file_sector_size(file: *mut ffi::sqlite3_file) -> c_int {
    bridge_file(file).map_or(4096, |handle| handle.sector_size())
}

unsafe extern "C" fn file_device_characteristics(file: *mut ffi::sqlite3_file) -> c_int {
    bridge_file(file).map_or(0, |handle| handle.device_characteristics())
}
