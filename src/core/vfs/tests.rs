//! Tests for the storage backends and the engine VFS bridge

use super::*;
use crate::core::engine::Engine;
use rusqlite::{params, Connection, ErrorCode};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// Global lock to ensure tests touching custom registrations run serially
use std::sync::Mutex as StdMutex;
static VFS_TEST_LOCK: StdMutex<()> = StdMutex::new(());

fn rw_create() -> OpenFlags {
    OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB
}

fn open_uri(uri: &str) -> Connection {
    let conn = Connection::open_with_flags(
        uri,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            | rusqlite::OpenFlags::SQLITE_OPEN_URI,
    )
    .unwrap();
    conn.busy_timeout(Duration::ZERO).unwrap();
    conn
}

#[test]
fn test_lock_escalation_protocol() {
    let mut table = LockTable::new();
    let mut a = LockLevel::None;
    let mut b = LockLevel::None;

    assert!(table.acquire(&mut a, LockLevel::Shared).unwrap());
    assert!(table.acquire(&mut b, LockLevel::Shared).unwrap());
    assert_eq!(table.readers(), 2);

    // One writer at a time
    assert!(table.acquire(&mut a, LockLevel::Reserved).unwrap());
    assert!(!table.acquire(&mut b, LockLevel::Reserved).unwrap());
    assert!(table.is_reserved());

    // Exclusive waits for the other reader, holding PENDING meanwhile
    assert!(!table.acquire(&mut a, LockLevel::Exclusive).unwrap());
    assert_eq!(a, LockLevel::Pending);

    // No new readers while pending
    let mut c = LockLevel::None;
    assert!(!table.acquire(&mut c, LockLevel::Shared).unwrap());
    assert_eq!(c, LockLevel::None);

    table.release(&mut b, LockLevel::None).unwrap();
    assert!(table.acquire(&mut a, LockLevel::Exclusive).unwrap());
    assert_eq!(a, LockLevel::Exclusive);

    table.release(&mut a, LockLevel::Shared).unwrap();
    assert!(!table.is_reserved());
    assert!(table.acquire(&mut c, LockLevel::Shared).unwrap());
}

#[test]
fn test_lock_rejects_invalid_transitions() {
    let mut table = LockTable::new();
    let mut held = LockLevel::None;

    // RESERVED and EXCLUSIVE require SHARED first; PENDING is never requested
    assert!(matches!(
        table.acquire(&mut held, LockLevel::Reserved),
        Err(VfsError::InvalidLockTransition { .. })
    ));
    assert!(table.acquire(&mut held, LockLevel::Exclusive).is_err());
    assert!(table.acquire(&mut held, LockLevel::Pending).is_err());
    assert_eq!(held, LockLevel::None);

    // Unlock only ever lowers to SHARED or NONE
    table.acquire(&mut held, LockLevel::Shared).unwrap();
    assert!(table.release(&mut held, LockLevel::Reserved).is_err());
    assert_eq!(held, LockLevel::Shared);
}

#[test]
fn test_exclusive_blocks_every_lock() {
    let mut table = LockTable::new();
    let mut writer = LockLevel::None;
    let mut reader = LockLevel::None;

    table.acquire(&mut writer, LockLevel::Shared).unwrap();
    assert!(table.acquire(&mut writer, LockLevel::Exclusive).unwrap());
    assert!(!table.acquire(&mut reader, LockLevel::Shared).unwrap());
}

#[test]
fn test_table_level_and_pending_fallback() {
    let mut table = LockTable::new();
    let mut writer = LockLevel::None;
    let mut reader = LockLevel::None;
    assert_eq!(table.level(), LockLevel::None);

    table.acquire(&mut reader, LockLevel::Shared).unwrap();
    table.acquire(&mut writer, LockLevel::Shared).unwrap();
    assert_eq!(table.level(), LockLevel::Shared);
    table.acquire(&mut writer, LockLevel::Reserved).unwrap();
    assert_eq!(table.level(), LockLevel::Reserved);

    table.release(&mut reader, LockLevel::None).unwrap();
    assert!(table.acquire(&mut writer, LockLevel::Exclusive).unwrap());
    assert_eq!(table.level(), LockLevel::Exclusive);

    table.fall_back_to_pending(&mut writer);
    assert_eq!(writer, LockLevel::Pending);
    assert_eq!(table.level(), LockLevel::Pending);
    assert!(!table.acquire(&mut reader, LockLevel::Shared).unwrap());

    table.release(&mut writer, LockLevel::None).unwrap();
    assert_eq!(table.level(), LockLevel::None);
}

#[test]
fn test_lock_registry_drops_idle_tables() {
    let registry: LockRegistry = LockRegistry::new();
    let a = registry.attach("/db");
    let b = registry.attach("/db");
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(registry.len(), 1);

    registry.detach("/db", a);
    assert_eq!(registry.len(), 1);
    registry.detach("/db", b);
    assert!(registry.is_empty());
}

#[test]
fn test_memory_handles_share_one_store() {
    let backend = MemoryBackend::new(Retention::Release);
    let mut a = backend.open(Some("/shared/db"), rw_create()).unwrap();
    let mut b = backend.open(Some("/shared/db"), rw_create()).unwrap();

    a.write_at(0, b"hello").unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(b.read_at(0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");

    // Same name in a private namespace is a different store
    let c = backend.open(Some("/private/1/db"), rw_create()).unwrap();
    assert_eq!(c.file_size().unwrap(), 0);
    assert_eq!(backend.store_count(), 2);

    a.close().unwrap();
    assert!(backend.store("/shared/db").is_some());
    b.close().unwrap();
    assert!(backend.store("/shared/db").is_none());
    drop(c);
    assert_eq!(backend.store_count(), 0);
}

#[test]
fn test_memory_retain_outlives_handles() {
    let backend = MemoryBackend::new(Retention::Retain);
    let mut file = backend.open(Some("kept.db"), rw_create()).unwrap();
    file.write_at(0, &[1, 2, 3]).unwrap();
    file.close().unwrap();

    let store = backend.store("/kept.db").unwrap();
    assert_eq!(store.snapshot(), vec![1, 2, 3]);
    assert!(backend.access("kept.db", AccessCheck::Exists).unwrap());

    backend.delete("kept.db", false).unwrap();
    assert!(!backend.access("kept.db", AccessCheck::Exists).unwrap());
    assert!(matches!(
        backend.delete("kept.db", false),
        Err(VfsError::NotFound(_))
    ));
}

#[test]
fn test_memory_open_without_create_fails() {
    let backend = MemoryBackend::new(Retention::Release);
    let result = backend.open(Some("/missing"), OpenFlags::READ_WRITE);
    assert!(matches!(result, Err(VfsError::NotFound(_))));
}

#[test]
fn test_memory_short_read_and_truncate() {
    let backend = MemoryBackend::new(Retention::Release);
    let mut file = backend.open(None, rw_create()).unwrap();
    file.write_at(4, &[9; 4]).unwrap();
    assert_eq!(file.file_size().unwrap(), 8);

    let mut buf = [0xffu8; 16];
    assert_eq!(file.read_at(0, &mut buf).unwrap(), 8);
    assert_eq!(&buf[..8], &[0, 0, 0, 0, 9, 9, 9, 9]);
    assert_eq!(file.read_at(100, &mut buf).unwrap(), 0);

    file.truncate(2).unwrap();
    assert_eq!(file.file_size().unwrap(), 2);
    // Anonymous files are never registered
    assert_eq!(backend.store_count(), 0);
}

#[test]
fn test_memory_read_only_handle_refuses_writes() {
    let backend = MemoryBackend::new(Retention::Release);
    let _owner = backend.open(Some("/ro"), rw_create()).unwrap();
    let mut reader = backend.open(Some("/ro"), OpenFlags::READ_ONLY).unwrap();
    assert!(reader.is_read_only());
    assert!(matches!(reader.write_at(0, b"x"), Err(VfsError::ReadOnly)));
}

#[test]
fn test_native_temp_file_deleted_on_close() {
    let backend = NativeBackend::new();
    let mut file = backend.open(None, rw_create()).unwrap();
    file.write_at(0, b"scratch").unwrap();
    let mut buf = [0u8; 7];
    assert_eq!(file.read_at(0, &mut buf).unwrap(), 7);
    assert_eq!(backend.tracked_files(), 1);
    file.close().unwrap();
    assert_eq!(backend.tracked_files(), 0);
}

#[test]
fn test_native_locks_shared_across_handles() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("locks.db");
    let name = path.to_str().unwrap();

    let backend = NativeBackend::new();
    let mut a = backend.open(Some(name), rw_create()).unwrap();
    let mut b = backend.open(Some(name), rw_create()).unwrap();

    assert!(a.lock(LockLevel::Shared).unwrap());
    assert!(a.lock(LockLevel::Exclusive).unwrap());
    assert!(!b.lock(LockLevel::Shared).unwrap());
    assert!(b.check_reserved_lock().unwrap());

    a.close().unwrap();
    assert!(b.lock(LockLevel::Shared).unwrap());
}

// Separate backends keep separate lock tables, like separate processes
#[cfg(target_os = "linux")]
#[test]
fn test_native_backends_coordinate_through_file_locks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("two-owners.db");
    let name = path.to_str().unwrap();

    let first = NativeBackend::new();
    let second = NativeBackend::new();
    let mut a = first.open(Some(name), rw_create()).unwrap();
    let mut b = second.open(Some(name), rw_create()).unwrap();

    assert!(a.lock(LockLevel::Shared).unwrap());
    assert!(b.lock(LockLevel::Shared).unwrap());
    assert!(a.lock(LockLevel::Reserved).unwrap());
    assert!(b.check_reserved_lock().unwrap());
    assert!(!b.lock(LockLevel::Reserved).unwrap());
    assert_eq!(b.lock_level(), LockLevel::Shared);

    // b still reads, so a stops at PENDING
    assert!(!a.lock(LockLevel::Exclusive).unwrap());
    assert_eq!(a.lock_level(), LockLevel::Pending);
    b.unlock(LockLevel::None).unwrap();
    assert!(!b.lock(LockLevel::Shared).unwrap());
    assert_eq!(b.lock_level(), LockLevel::None);
    assert!(a.lock(LockLevel::Exclusive).unwrap());

    a.unlock(LockLevel::None).unwrap();
    assert!(b.lock(LockLevel::Shared).unwrap());
    assert_eq!(first.tracked_files(), 1);
    a.close().unwrap();
    assert_eq!(first.tracked_files(), 0);
}

#[test]
fn test_native_full_path_name_is_absolute() {
    let backend = NativeBackend::new();
    let full = backend.full_path_name("relative.db").unwrap();
    assert!(std::path::Path::new(&full).is_absolute());
    assert!(full.ends_with("relative.db"));
}

#[test]
fn test_engine_registers_builtin_vfs() {
    Engine::native().unwrap();
    assert!(is_registered(MEMORY_VFS));
    assert!(is_registered(NATIVE_VFS));
    assert!(registered_names().iter().any(|n| n == MEMORY_VFS));
}

#[test]
fn test_sqlite_through_memory_vfs() {
    Engine::native().unwrap();
    let uri = format!("file:vfs-visible?vfs={}", MEMORY_VFS);

    let writer = open_uri(&uri);
    writer
        .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
        .unwrap();
    writer
        .execute("INSERT INTO t (v) VALUES (?1)", params!["from writer"])
        .unwrap();

    let reader = open_uri(&uri);
    let v: String = reader
        .query_row("SELECT v FROM t WHERE id = 1", [], |row| row.get(0))
        .unwrap();
    assert_eq!(v, "from writer");
}

#[test]
fn test_exclusive_lock_contention_is_busy() {
    Engine::native().unwrap();
    let uri = format!("file:vfs-contention?vfs={}", MEMORY_VFS);

    let a = open_uri(&uri);
    a.execute_batch("CREATE TABLE t (x)").unwrap();
    let b = open_uri(&uri);

    a.execute_batch("BEGIN EXCLUSIVE").unwrap();
    let err = b
        .query_row("SELECT count(*) FROM t", [], |row| row.get::<_, i64>(0))
        .unwrap_err();
    match err {
        rusqlite::Error::SqliteFailure(e, _) => assert_eq!(e.code, ErrorCode::DatabaseBusy),
        other => panic!("expected busy, got {other:?}"),
    }

    a.execute_batch("COMMIT").unwrap();
    let n: i64 = b
        .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
        .unwrap();
    assert_eq!(n, 0);
}

#[test]
fn test_sqlite_through_native_vfs() {
    Engine::native().unwrap();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("native.db");

    {
        let conn = Connection::open_with_flags_and_vfs(
            &path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_CREATE,
            NATIVE_VFS,
        )
        .unwrap();
        conn.execute_batch("CREATE TABLE t (x); INSERT INTO t VALUES (42);")
            .unwrap();
    }

    // The file is a regular database readable by the default VFS
    assert!(path.exists());
    let conn = Connection::open(&path).unwrap();
    let x: i64 = conn.query_row("SELECT x FROM t", [], |row| row.get(0)).unwrap();
    assert_eq!(x, 42);
}

#[test]
fn test_custom_backend_registration() {
    let _lock = VFS_TEST_LOCK.lock(); // Serialize VFS tests

    let engine = Engine::native().unwrap();
    let backend = Arc::new(MemoryBackend::new(Retention::Retain));
    engine
        .register_backend("test-custom", backend.clone(), false)
        .unwrap();
    assert!(matches!(
        engine.register_backend("test-custom", backend.clone(), false),
        Err(crate::core::error::Error::VfsAlreadyRegistered(_))
    ));

    {
        let conn = open_uri("file:custom.db?vfs=test-custom");
        conn.execute_batch("CREATE TABLE t (x)").unwrap();
    }
    // Retained after the connection closed
    assert!(backend.store("/custom.db").is_some());
    assert!(!backend.store("/custom.db").unwrap().is_empty());

    engine.unregister_backend("test-custom").unwrap();
    assert!(!is_registered("test-custom"));
    assert!(engine.unregister_backend("test-custom").is_err());
}

#[test]
fn test_builtin_vfs_cannot_be_unregistered() {
    let engine = Engine::native().unwrap();
    assert!(engine.unregister_backend(MEMORY_VFS).is_err());
    assert!(is_registered(MEMORY_VFS));
}
