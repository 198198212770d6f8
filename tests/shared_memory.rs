//! Shared in-memory databases routed through the memory VFS

use sqlbridge_rs::{Database, DatabaseBuilder, Error, LockLevel, OpenConfig};
use std::time::Duration;

fn open(name: &str) -> Database {
    Database::open(&format!("file:{}?mode=memory&cache=shared", name)).unwrap()
}

#[test]
fn test_committed_write_visible_to_later_handle() {
    let writer = open("visibility");
    writer
        .execute("CREATE TABLE kv(k TEXT, v TEXT); INSERT INTO kv VALUES ('a', '1')", &[])
        .unwrap();

    let reader = open("visibility");
    let rows = reader.select("SELECT v FROM kv WHERE k = 'a'", &[]).unwrap();
    assert_eq!(rows.row(0).unwrap().get::<String>(0).unwrap(), "1");
}

#[test]
fn test_unshared_names_are_isolated() {
    let a = Database::open("file:isolated?mode=memory").unwrap();
    let b = Database::open("file:isolated?mode=memory").unwrap();
    a.execute("CREATE TABLE t(x)", &[]).unwrap();
    assert!(matches!(
        b.select("SELECT * FROM t", &[]),
        Err(Error::Sql(_))
    ));
}

#[test]
fn test_exclusive_lock_blocks_second_handle() {
    let a = open("contention");
    let b = open("contention");
    a.execute("CREATE TABLE t(x)", &[]).unwrap();

    a.execute("BEGIN EXCLUSIVE", &[]).unwrap();
    a.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
    assert_eq!(a.lock_state().unwrap(), LockLevel::Exclusive);

    let err = b.select("SELECT count(*) FROM t", &[]).unwrap_err();
    assert!(err.is_busy(), "expected busy, got {:?}", err);
    assert!(matches!(
        b.execute("INSERT INTO t VALUES (2)", &[]),
        Err(e) if e.is_busy()
    ));

    a.execute("COMMIT", &[]).unwrap();
    assert_eq!(a.lock_state().unwrap(), LockLevel::None);
    let rows = b.select("SELECT count(*) FROM t", &[]).unwrap();
    assert_eq!(rows.row(0).unwrap().get::<i64>(0).unwrap(), 1);
}

#[test]
fn test_reserved_lock_allows_readers() {
    let a = open("reserved");
    let b = open("reserved");
    a.execute("CREATE TABLE t(x); INSERT INTO t VALUES (1)", &[])
        .unwrap();

    a.execute("BEGIN IMMEDIATE", &[]).unwrap();
    a.execute("INSERT INTO t VALUES (2)", &[]).unwrap();
    assert_eq!(a.lock_state().unwrap(), LockLevel::Reserved);

    // the uncommitted row is not visible, but reading is not blocked
    let rows = b.select("SELECT count(*) FROM t", &[]).unwrap();
    assert_eq!(rows.row(0).unwrap().get::<i64>(0).unwrap(), 1);
    assert!(b.execute("BEGIN IMMEDIATE", &[]).unwrap_err().is_busy());

    a.execute("COMMIT", &[]).unwrap();
}

#[test]
fn test_busy_timeout_waits_for_release() {
    let config = OpenConfig {
        busy_timeout_ms: 5_000,
        ..Default::default()
    };
    let a = open("busy-wait");
    let b = Database::open_with_config("file:busy-wait?mode=memory&cache=shared", &config)
        .unwrap();
    a.execute("CREATE TABLE t(x)", &[]).unwrap();
    a.execute("BEGIN EXCLUSIVE", &[]).unwrap();

    let reader = std::thread::spawn(move || {
        let rows = b.select("SELECT count(*) FROM t", &[]).unwrap();
        rows.row(0).unwrap().get::<i64>(0).unwrap()
    });
    std::thread::sleep(Duration::from_millis(50));
    a.execute("INSERT INTO t VALUES (1); COMMIT", &[]).unwrap();

    assert_eq!(reader.join().unwrap(), 1);
}

#[test]
fn test_store_released_after_last_close() {
    {
        let a = open("released");
        a.execute("CREATE TABLE t(x)", &[]).unwrap();
    }
    let fresh = open("released");
    assert!(fresh.select("SELECT * FROM t", &[]).is_err());
}

#[test]
fn test_store_survives_while_any_handle_open() {
    let keeper = open("kept-alive");
    keeper.execute("CREATE TABLE t(x)", &[]).unwrap();
    {
        let other = open("kept-alive");
        other.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
    }
    let again = DatabaseBuilder::new()
        .in_memory(Some("kept-alive"), true)
        .build()
        .unwrap();
    let rows = again.select("SELECT count(*) FROM t", &[]).unwrap();
    assert_eq!(rows.row(0).unwrap().get::<i64>(0).unwrap(), 1);
}
