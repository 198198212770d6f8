//! On-disk databases through the native VFS and custom backends

use sqlbridge_rs::{
    params, Database, DatabaseBuilder, Engine, Error, MemoryBackend, OpenConfig, Retention,
    NATIVE_VFS,
};
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn test_data_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("persist.db");
    let path = path.to_str().unwrap();

    {
        let db = Database::open(path).unwrap();
        db.execute("CREATE TABLE t(x TEXT)", &[]).unwrap();
        db.execute("INSERT INTO t VALUES (?)", params!["durable"])
            .unwrap();
        db.set_user_version(3).unwrap();
    }

    let db = Database::open(path).unwrap();
    assert_eq!(db.user_version().unwrap(), 3);
    let rows = db.select("SELECT x FROM t", &[]).unwrap();
    assert_eq!(rows.row(0).unwrap().get::<String>(0).unwrap(), "durable");
    assert!(!dir.path().join("persist.db-journal").exists());
}

#[test]
fn test_uri_open_on_native_vfs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("uri.db");
    let uri = format!("file:{}?vfs={}", path.display(), NATIVE_VFS);

    let db = Database::open(&uri).unwrap();
    db.execute("CREATE TABLE t(x)", &[]).unwrap();
    drop(db);
    assert!(path.exists());
}

#[test]
fn test_read_only_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ro.db");
    let path = path.to_str().unwrap();
    Database::open(path)
        .unwrap()
        .execute("CREATE TABLE t(x)", &[])
        .unwrap();

    let db = DatabaseBuilder::new().path(path).read_only().build().unwrap();
    db.select("SELECT * FROM t", &[]).unwrap();
    let err = db.execute("INSERT INTO t VALUES (1)", &[]).unwrap_err();
    assert_eq!(err.sql_code(), Some(libsqlite3_sys::SQLITE_READONLY));
}

#[test]
fn test_two_native_connections_contend() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("contend.db");
    let path = path.to_str().unwrap();

    let a = Database::open(path).unwrap();
    let b = Database::open(path).unwrap();
    a.execute("CREATE TABLE t(x)", &[]).unwrap();
    a.execute("BEGIN EXCLUSIVE", &[]).unwrap();
    assert!(b.select("SELECT * FROM t", &[]).unwrap_err().is_busy());
    a.execute("COMMIT", &[]).unwrap();
    b.select("SELECT * FROM t", &[]).unwrap();
}

#[test]
fn test_custom_backend_registration() {
    let engine = Engine::native().unwrap();
    engine
        .register_backend(
            "test-custom-store",
            Arc::new(MemoryBackend::new(Retention::Retain)),
            false,
        )
        .unwrap();
    assert!(matches!(
        engine.register_backend(
            "test-custom-store",
            Arc::new(MemoryBackend::new(Retention::Retain)),
            false
        ),
        Err(Error::VfsAlreadyRegistered(_))
    ));

    let config = OpenConfig {
        vfs: Some("test-custom-store".to_string()),
        ..Default::default()
    };
    {
        let db = Database::open_with_config("notes.db", &config).unwrap();
        db.execute("CREATE TABLE n(body); INSERT INTO n VALUES ('kept')", &[])
            .unwrap();
    }
    // retained stores outlive their last connection
    let db = Database::open_with_config("notes.db", &config).unwrap();
    let rows = db.select("SELECT body FROM n", &[]).unwrap();
    assert_eq!(rows.len(), 1);
    drop(db);

    engine.unregister_backend("test-custom-store").unwrap();
    assert!(Database::open_with_config("notes.db", &config).is_err());
}

#[test]
fn test_builtin_backends_cannot_be_unregistered() {
    let engine = Engine::native().unwrap();
    assert!(engine.unregister_backend(NATIVE_VFS).is_err());
}

/// A second engine client on the same file, through the engine's own unix VFS
#[cfg(target_os = "linux")]
fn unix_client(path: &str) -> rusqlite::Connection {
    let conn = rusqlite::Connection::open_with_flags(
        format!("file:{}?vfs=unix", path),
        rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_URI,
    )
    .unwrap();
    conn.busy_timeout(std::time::Duration::ZERO).unwrap();
    conn
}

#[cfg(target_os = "linux")]
fn is_busy(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(rusqlite::ErrorCode::DatabaseBusy)
}

#[cfg(target_os = "linux")]
#[test]
fn test_external_exclusive_lock_blocks_access() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared-file.db");
    let path = path.to_str().unwrap();

    let db = Database::open(path).unwrap();
    db.execute("CREATE TABLE t(x)", &[]).unwrap();

    let other = unix_client(path);
    other
        .execute_batch("BEGIN EXCLUSIVE; INSERT INTO t VALUES (1);")
        .unwrap();

    assert!(db.execute("INSERT INTO t VALUES (2)", &[]).unwrap_err().is_busy());
    assert!(db.select("SELECT x FROM t", &[]).unwrap_err().is_busy());

    other.execute_batch("COMMIT").unwrap();
    db.execute("INSERT INTO t VALUES (2)", &[]).unwrap();
    let rows = db.select("SELECT x FROM t ORDER BY x", &[]).unwrap();
    let xs: Vec<i64> = rows.iter().map(|r| r.get::<i64>(0).unwrap()).collect();
    assert_eq!(xs, vec![1, 2]);
}

#[cfg(target_os = "linux")]
#[test]
fn test_native_locks_are_visible_to_other_clients() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("visible.db");
    let path = path.to_str().unwrap();

    let db = Database::open(path).unwrap();
    db.execute("CREATE TABLE t(x)", &[]).unwrap();
    let other = unix_client(path);

    // RESERVED: the other client may read but not write
    db.execute("BEGIN IMMEDIATE", &[]).unwrap();
    db.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
    let count: i64 = other
        .query_row("SELECT count(*) FROM t", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 0);
    assert!(is_busy(
        &other.execute("INSERT INTO t VALUES (9)", []).unwrap_err()
    ));
    db.execute("COMMIT", &[]).unwrap();

    // EXCLUSIVE: the other client may not even read
    db.execute("BEGIN EXCLUSIVE", &[]).unwrap();
    assert!(is_busy(
        &other
            .query_row("SELECT count(*) FROM t", [], |r| r.get::<_, i64>(0))
            .unwrap_err()
    ));
    db.execute("ROLLBACK", &[]).unwrap();

    let count: i64 = other
        .query_row("SELECT count(*) FROM t", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn test_paths_naming_one_file_share_lock_state() {
    let dir = TempDir::new().unwrap();
    let direct = dir.path().join("alias.db");
    let dotted = dir.path().join(".").join("alias.db");

    let a = Database::open(direct.to_str().unwrap()).unwrap();
    a.execute("CREATE TABLE t(x)", &[]).unwrap();
    let b = Database::open(dotted.to_str().unwrap()).unwrap();

    a.execute("BEGIN EXCLUSIVE", &[]).unwrap();
    assert!(b.select("SELECT * FROM t", &[]).unwrap_err().is_busy());
    a.execute("COMMIT", &[]).unwrap();
    assert!(b.select("SELECT * FROM t", &[]).unwrap().is_empty());
}
