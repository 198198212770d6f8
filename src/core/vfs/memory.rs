//! In-memory storage backend
//!
//! Stores live in a registry keyed by canonical name plus a shared flag.
//! Handles opened on the same key share one store, which is how two
//! connections to a shared in-memory database see each other's writes and
//! contend for the same locks.

use super::backend::{
    AccessCheck, OpenFlags, StorageBackend, StorageFile, SyncFlags, VfsError, VfsResult,
};
use super::lock::{LockLevel, LockTable};
use ahash::RandomState;
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::raw::c_int;
use std::sync::Arc;
use tracing::debug;

/// Name prefix of databases that may be reached by more than one connection
pub const SHARED_PREFIX: &str = "/shared/";
/// Name prefix of databases private to one connection
pub const PRIVATE_PREFIX: &str = "/private/";

/// What happens to a store once its last handle closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Discard the store (in-memory databases)
    Release,
    /// Keep the store until it is deleted (durable storage emulation)
    Retain,
}

/// Registry key of a store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub name: String,
    pub shared: bool,
}

impl StoreKey {
    pub fn from_path(path: &str) -> Self {
        Self {
            name: path.to_string(),
            shared: !path.starts_with(PRIVATE_PREFIX),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    data: Vec<u8>,
    locks: LockTable,
    handles: usize,
}

/// One named byte-addressable storage object
#[derive(Debug)]
pub struct MemoryStore {
    key: Option<StoreKey>,
    main_db: bool,
    state: Mutex<StoreState>,
}

impl MemoryStore {
    fn new(key: Option<StoreKey>, main_db: bool) -> Self {
        Self {
            key,
            main_db,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the store's contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }
}

#[derive(Debug)]
struct Registry {
    retention: Retention,
    stores: Mutex<HashMap<StoreKey, Arc<MemoryStore>, RandomState>>,
}

impl Registry {
    /// Drop `store` from the registry. Releasing a main database also drops
    /// its idle side files (`<name>-journal`, `<name>-wal`).
    fn release(&self, store: &Arc<MemoryStore>, force: bool) {
        let Some(key) = &store.key else { return };
        let mut stores = self.stores.lock();
        // a concurrent open may have revived the store
        let releasable = stores.get(key).is_some_and(|current| {
            Arc::ptr_eq(current, store) && (force || current.state.lock().handles == 0)
        });
        if !releasable {
            return;
        }
        stores.remove(key);
        debug!("Released in-memory store {}", key.name);

        if store.main_db {
            let prefix = format!("{}-", key.name);
            stores.retain(|k, s| {
                k.shared != key.shared
                    || !k.name.starts_with(&prefix)
                    || s.state.lock().handles > 0
            });
        }
    }
}

/// Backend serving files from process memory
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    registry: Arc<Registry>,
}

impl MemoryBackend {
    pub fn new(retention: Retention) -> Self {
        Self {
            registry: Arc::new(Registry {
                retention,
                stores: Mutex::new(HashMap::default()),
            }),
        }
    }

    pub fn retention(&self) -> Retention {
        self.registry.retention
    }

    /// The store currently registered under `name`
    pub fn store(&self, name: &str) -> Option<Arc<MemoryStore>> {
        let key = StoreKey::from_path(&canonicalize(name));
        self.registry.stores.lock().get(&key).cloned()
    }

    /// Number of registered stores
    pub fn store_count(&self) -> usize {
        self.registry.stores.lock().len()
    }
}

fn canonicalize(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    }
}

impl StorageBackend for MemoryBackend {
    fn open(&self, name: Option<&str>, flags: OpenFlags) -> VfsResult<Box<dyn StorageFile>> {
        let store = match name {
            None => {
                let store = Arc::new(MemoryStore::new(None, false));
                store.state.lock().handles += 1;
                store
            }
            Some(name) => {
                let key = StoreKey::from_path(&canonicalize(name));
                let mut stores = self.registry.stores.lock();
                match stores.get(&key) {
                    Some(existing) => {
                        if flags.exclusive() && flags.create() {
                            return Err(VfsError::CantOpen(key.name));
                        }
                        existing.state.lock().handles += 1;
                        existing.clone()
                    }
                    None => {
                        if !flags.create() {
                            return Err(VfsError::NotFound(key.name));
                        }
                        debug!("Created in-memory store {} (shared: {})", key.name, key.shared);
                        let store =
                            Arc::new(MemoryStore::new(Some(key.clone()), flags.is_main_db()));
                        store.state.lock().handles += 1;
                        stores.insert(key, store.clone());
                        store
                    }
                }
            }
        };

        Ok(Box::new(MemoryFile {
            store,
            registry: self.registry.clone(),
            held: LockLevel::None,
            read_only: flags.is_read_only(),
            delete_on_close: flags.delete_on_close(),
            closed: false,
        }))
    }

    fn delete(&self, name: &str, _sync_dir: bool) -> VfsResult<()> {
        let key = StoreKey::from_path(&canonicalize(name));
        match self.registry.stores.lock().remove(&key) {
            Some(_) => Ok(()),
            None => Err(VfsError::NotFound(key.name)),
        }
    }

    fn access(&self, name: &str, _check: AccessCheck) -> VfsResult<bool> {
        let key = StoreKey::from_path(&canonicalize(name));
        Ok(self.registry.stores.lock().contains_key(&key))
    }

    fn full_path_name(&self, name: &str) -> VfsResult<String> {
        Ok(canonicalize(name))
    }
}

/// Handle on a [`MemoryStore`]
#[derive(Debug)]
pub struct MemoryFile {
    store: Arc<MemoryStore>,
    registry: Arc<Registry>,
    held: LockLevel,
    read_only: bool,
    delete_on_close: bool,
    closed: bool,
}

impl StorageFile for MemoryFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let state = self.store.state.lock();
        let len = state.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let available = (state.data.len() - start).min(buf.len());
        buf[..available].copy_from_slice(&state.data[start..start + available]);
        Ok(available)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> VfsResult<()> {
        if self.read_only {
            return Err(VfsError::ReadOnly);
        }
        let mut state = self.store.state.lock();
        let start = offset as usize;
        let end = start + data.len();
        if state.data.len() < end {
            state.data.resize(end, 0);
        }
        state.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> VfsResult<()> {
        if self.read_only {
            return Err(VfsError::ReadOnly);
        }
        let mut state = self.store.state.lock();
        if (size as usize) < state.data.len() {
            state.data.truncate(size as usize);
        }
        Ok(())
    }

    fn sync(&mut self, _flags: SyncFlags) -> VfsResult<()> {
        Ok(())
    }

    fn file_size(&self) -> VfsResult<u64> {
        Ok(self.store.state.lock().data.len() as u64)
    }

    fn lock(&mut self, level: LockLevel) -> VfsResult<bool> {
        let mut state = self.store.state.lock();
        state.locks.acquire(&mut self.held, level)
    }

    fn unlock(&mut self, level: LockLevel) -> VfsResult<()> {
        let mut state = self.store.state.lock();
        state.locks.release(&mut self.held, level)
    }

    fn check_reserved_lock(&self) -> VfsResult<bool> {
        Ok(self.store.state.lock().locks.is_reserved())
    }

    fn lock_level(&self) -> LockLevel {
        self.held
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn device_characteristics(&self) -> c_int {
        ffi::SQLITE_IOCAP_ATOMIC
            | ffi::SQLITE_IOCAP_POWERSAFE_OVERWRITE
            | ffi::SQLITE_IOCAP_SAFE_APPEND
            | ffi::SQLITE_IOCAP_SEQUENTIAL
    }

    fn close(&mut self) -> VfsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let remaining = {
            let mut state = self.store.state.lock();
            state.locks.release(&mut self.held, LockLevel::None)?;
            state.handles -= 1;
            state.handles
        };
        // Side files outlive their handles until the engine deletes them
        let idle_main = remaining == 0 && self.store.main_db;
        if self.delete_on_close {
            self.registry.release(&self.store, true);
        } else if idle_main && self.registry.retention == Retention::Release {
            self.registry.release(&self.store, false);
        }
        Ok(())
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
