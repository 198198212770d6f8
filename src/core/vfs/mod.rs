//! Storage backends and their engine VFS bridge
//!
//! Three VFSes are registered by the engines:
//!
//! - [`MEMORY_VFS`]: in-memory databases, discarded with their last handle
//! - [`NATIVE_VFS`]: host files with advisory record locks (native target only)
//! - [`SANDBOX_VFS`]: durable-storage emulation kept in process memory
//!   (sandboxed target only)
//!
//! Custom backends can be added with [`register`].

mod advisory;
mod backend;
mod bridge;
mod lock;
mod memory;
mod native;

#[cfg(test)]
mod tests;

pub use backend::{
    AccessCheck, OpenFlags, StorageBackend, StorageFile, SyncFlags, VfsError, VfsResult,
};
pub use bridge::{ensure_registered, is_registered, register, registered_names, unregister};
pub use lock::{LockLevel, LockRegistry, LockTable};
pub use memory::{MemoryBackend, MemoryFile, MemoryStore, Retention, StoreKey, PRIVATE_PREFIX, SHARED_PREFIX};
pub use native::{NativeBackend, NativeFile};

/// In-memory databases
pub const MEMORY_VFS: &str = "sqlbridge-memory";
/// Host file system pass-through
pub const NATIVE_VFS: &str = "sqlbridge-native";
/// Sandboxed durable storage
pub const SANDBOX_VFS: &str = "sqlbridge-sandbox";
