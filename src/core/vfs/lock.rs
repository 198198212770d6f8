//! Five-level file lock protocol
//!
//! Every storage object carries one [`LockTable`] shared by all handles open
//! on it; each handle tracks the [`LockLevel`] it holds. Lock requests are
//! resolved here and nowhere else.

use super::VfsError;
use ahash::RandomState;
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::raw::c_int;
use std::sync::Arc;

/// Lock levels, ordered NONE < SHARED < RESERVED < PENDING < EXCLUSIVE
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockLevel {
    #[default]
    None,
    Shared,
    Reserved,
    Pending,
    Exclusive,
}

impl LockLevel {
    pub fn from_raw(level: c_int) -> Option<Self> {
        match level {
            ffi::SQLITE_LOCK_NONE => Some(LockLevel::None),
            ffi::SQLITE_LOCK_SHARED => Some(LockLevel::Shared),
            ffi::SQLITE_LOCK_RESERVED => Some(LockLevel::Reserved),
            ffi::SQLITE_LOCK_PENDING => Some(LockLevel::Pending),
            ffi::SQLITE_LOCK_EXCLUSIVE => Some(LockLevel::Exclusive),
            _ => None,
        }
    }

    pub fn as_raw(self) -> c_int {
        match self {
            LockLevel::None => ffi::SQLITE_LOCK_NONE,
            LockLevel::Shared => ffi::SQLITE_LOCK_SHARED,
            LockLevel::Reserved => ffi::SQLITE_LOCK_RESERVED,
            LockLevel::Pending => ffi::SQLITE_LOCK_PENDING,
            LockLevel::Exclusive => ffi::SQLITE_LOCK_EXCLUSIVE,
        }
    }
}

/// Lock state of one storage object across all of its handles
///
/// Holding PENDING or EXCLUSIVE always implies holding the reserved slot, so
/// at most one handle is ever past SHARED.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockTable {
    shared: u32,
    reserved: bool,
    pending: bool,
    exclusive: bool,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `held` to `want`.
    ///
    /// Returns `Ok(false)` when another handle's lock blocks the request. A
    /// blocked EXCLUSIVE request leaves the caller at PENDING so no new
    /// readers can enter while existing ones drain.
    pub fn acquire(&mut self, held: &mut LockLevel, want: LockLevel) -> Result<bool, VfsError> {
        if want <= *held {
            return Ok(true);
        }
        let invalid = VfsError::InvalidLockTransition {
            from: *held,
            to: want,
        };

        match want {
            LockLevel::None | LockLevel::Pending => Err(invalid),
            LockLevel::Shared => {
                if self.pending || self.exclusive {
                    return Ok(false);
                }
                self.shared += 1;
                *held = LockLevel::Shared;
                Ok(true)
            }
            LockLevel::Reserved => {
                if *held != LockLevel::Shared {
                    return Err(invalid);
                }
                if self.reserved {
                    return Ok(false);
                }
                self.reserved = true;
                *held = LockLevel::Reserved;
                Ok(true)
            }
            LockLevel::Exclusive => {
                if *held == LockLevel::None {
                    return Err(invalid);
                }
                if *held == LockLevel::Shared {
                    if self.reserved {
                        return Ok(false);
                    }
                    self.reserved = true;
                }
                if *held < LockLevel::Pending {
                    self.pending = true;
                    *held = LockLevel::Pending;
                }
                if self.shared > 1 {
                    return Ok(false);
                }
                self.exclusive = true;
                *held = LockLevel::Exclusive;
                Ok(true)
            }
        }
    }

    /// Lower `held` to `to`, which must be SHARED or NONE
    pub fn release(&mut self, held: &mut LockLevel, to: LockLevel) -> Result<(), VfsError> {
        if to > LockLevel::Shared {
            return Err(VfsError::InvalidLockTransition { from: *held, to });
        }
        if to >= *held {
            return Ok(());
        }

        if *held >= LockLevel::Reserved {
            self.reserved = false;
        }
        if *held >= LockLevel::Pending {
            self.pending = false;
        }
        if *held == LockLevel::Exclusive {
            self.exclusive = false;
        }
        if to == LockLevel::None {
            self.shared = self.shared.saturating_sub(1);
        }
        *held = to;
        Ok(())
    }

    /// Settle a handle granted EXCLUSIVE back at PENDING, for when a lock
    /// outside this table refuses the final step
    pub fn fall_back_to_pending(&mut self, held: &mut LockLevel) {
        if *held == LockLevel::Exclusive {
            self.exclusive = false;
            *held = LockLevel::Pending;
        }
    }

    /// Strongest lock any handle holds
    pub fn level(&self) -> LockLevel {
        if self.exclusive {
            LockLevel::Exclusive
        } else if self.pending {
            LockLevel::Pending
        } else if self.reserved {
            LockLevel::Reserved
        } else if self.shared > 0 {
            LockLevel::Shared
        } else {
            LockLevel::None
        }
    }

    /// True when any handle holds RESERVED or higher
    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    pub fn readers(&self) -> u32 {
        self.shared
    }
}

/// Per-file lock state keyed by file identity, for backends whose storage
/// objects are not themselves shared in-process (the file-system pass-through)
#[derive(Debug)]
pub struct LockRegistry<T = LockTable> {
    tables: Mutex<HashMap<String, Arc<Mutex<T>>, RandomState>>,
}

impl<T> Default for LockRegistry<T> {
    fn default() -> Self {
        Self {
            tables: Mutex::new(HashMap::default()),
        }
    }
}

impl<T> LockRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// State for `key`, created on first attach
    pub fn attach(&self, key: &str) -> Arc<Mutex<T>>
    where
        T: Default,
    {
        let mut tables = self.tables.lock();
        tables
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(T::default())))
            .clone()
    }

    /// State for `key`, built by `make` on first attach
    pub fn attach_with<E>(
        &self,
        key: &str,
        make: impl FnOnce() -> Result<T, E>,
    ) -> Result<Arc<Mutex<T>>, E> {
        let mut tables = self.tables.lock();
        if let Some(state) = tables.get(key) {
            return Ok(state.clone());
        }
        let state = Arc::new(Mutex::new(make()?));
        tables.insert(key.to_string(), state.clone());
        Ok(state)
    }

    /// Drop a handle's reference; the state goes away with its last handle
    pub fn detach(&self, key: &str, table: Arc<Mutex<T>>) {
        let mut tables = self.tables.lock();
        drop(table);
        if let Some(entry) = tables.get(key) {
            if Arc::strong_count(entry) == 1 {
                tables.remove(key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
