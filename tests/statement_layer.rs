//! Statement preparation, binding and row access through the public API

use sqlbridge_rs::{params, Database, Error, Value, ValueType};

fn people() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.execute(
        "CREATE TABLE people(id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER, score REAL, avatar BLOB)",
        &[],
    )
    .unwrap();
    db
}

#[test]
fn test_positional_binding_of_every_type() {
    let db = people();
    db.execute(
        "INSERT INTO people(name, age, score, avatar) VALUES (?, ?, ?, ?)",
        params!["ada", 36, 9.5, vec![0u8, 1, 2]],
    )
    .unwrap();
    db.execute(
        "INSERT INTO people(name, age, score, avatar) VALUES (?, ?, ?, ?)",
        params!["bob", Value::Null, Option::<f64>::None, Value::Null],
    )
    .unwrap();

    let rows = db
        .select("SELECT name, age, score, avatar FROM people ORDER BY id", &[])
        .unwrap();
    assert_eq!(rows.column_names(), &["name", "age", "score", "avatar"]);
    assert_eq!(rows.len(), 2);

    let ada = rows.row(0).unwrap();
    assert_eq!(ada.get::<String>(0).unwrap(), "ada");
    assert_eq!(ada.get::<i64>(1).unwrap(), 36);
    assert_eq!(ada.get::<f64>(2).unwrap(), 9.5);
    assert_eq!(ada.get::<Vec<u8>>(3).unwrap(), vec![0, 1, 2]);

    let bob = rows.row(1).unwrap();
    assert!(bob.get_ref(1).unwrap().is_null());
    assert_eq!(bob.get::<Option<i64>>(1).unwrap(), None);
    assert_eq!(bob.get_ref(3).unwrap().value_type(), ValueType::Null);
}

#[test]
fn test_numbered_parameters() {
    let db = people();
    let rows = db.select("SELECT ?2 - ?1", params![10, 52]).unwrap();
    assert_eq!(rows.row(0).unwrap().get::<i64>(0).unwrap(), 42);
}

#[test]
fn test_execute_with_params_rejects_multiple_statements() {
    let db = people();
    let result = db.execute(
        "INSERT INTO people(name) VALUES (?); INSERT INTO people(name) VALUES ('x')",
        params!["first"],
    );
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    // nothing ran
    let rows = db.select("SELECT count(*) FROM people", &[]).unwrap();
    assert_eq!(rows.row(0).unwrap().get::<i64>(0).unwrap(), 0);
}

#[test]
fn test_execute_without_params_runs_every_statement() {
    let db = people();
    db.execute(
        "INSERT INTO people(name) VALUES ('a'); INSERT INTO people(name) VALUES ('b');",
        &[],
    )
    .unwrap();
    let rows = db.select("SELECT name FROM people ORDER BY id", &[]).unwrap();
    let names: Vec<String> = rows.iter().map(|r| r.get(0).unwrap()).collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[test]
fn test_select_returns_last_statement_rows() {
    let db = people();
    let rows = db
        .select("INSERT INTO people(name) VALUES ('z'); SELECT name FROM people", &[])
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows.row(0).unwrap().get::<String>(0).unwrap(), "z");
}

#[test]
fn test_statement_reuse() {
    let db = people();
    let mut insert = db.prepare("INSERT INTO people(name, age) VALUES (?, ?)").unwrap();
    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        assert_eq!(insert.execute(params![*name, i as i64]).unwrap(), 1);
        assert_eq!(db.last_insert_rowid().unwrap(), i as i64 + 1);
    }
    assert_eq!(db.execute("UPDATE people SET age = age + 1", &[]).unwrap(), 3);
    assert_eq!(db.changes().unwrap(), 3);
}

#[test]
fn test_dropping_cursor_resets_statement() {
    let db = people();
    db.execute("INSERT INTO people(name) VALUES ('a'), ('b'), ('c')", &[])
        .unwrap();
    let mut stmt = db.prepare("SELECT name FROM people ORDER BY id").unwrap();

    {
        let mut rows = stmt.query(&[]).unwrap();
        assert_eq!(rows.next().unwrap().unwrap().get::<String>(0).unwrap(), "a");
        assert_eq!(rows.next().unwrap().unwrap().get::<String>(0).unwrap(), "b");
    }

    let mut rows = stmt.query(&[]).unwrap();
    let first = rows.next().unwrap().unwrap();
    assert_eq!(first.get_by_name::<String>("name").unwrap(), "a");
}

#[test]
fn test_conversion_errors() {
    let db = people();
    let rows = db
        .select("SELECT 300, 1.5, 'text', x'00'", &[])
        .unwrap();
    let row = rows.row(0).unwrap();

    assert!(matches!(row.get::<i8>(0), Err(Error::IntegerOverflow(300))));
    assert_eq!(row.get::<u16>(0).unwrap(), 300);
    assert_eq!(row.get::<f64>(0).unwrap(), 300.0);
    assert!(matches!(
        row.get::<i64>(1),
        Err(Error::InvalidColumnType { index: 1, .. })
    ));
    assert!(matches!(
        row.get::<Vec<u8>>(2),
        Err(Error::InvalidColumnType { index: 2, .. })
    ));
    assert!(matches!(
        row.get::<String>(3),
        Err(Error::InvalidColumnType { index: 3, .. })
    ));
}

#[test]
fn test_constraint_violation_is_structured() {
    let db = people();
    let err = db
        .execute("INSERT INTO people(name) VALUES (NULL)", &[])
        .unwrap_err();
    match err {
        Error::Sql(e) => {
            assert_eq!(e.code, libsqlite3_sys::SQLITE_CONSTRAINT);
            assert_eq!(e.extended_code, libsqlite3_sys::SQLITE_CONSTRAINT_NOTNULL);
            let explanation = e.explanation.unwrap();
            assert!(explanation.ends_with(&format!("(code {})", e.extended_code)));
            assert_eq!(e.operation.as_deref(), Some("executing"));
        }
        other => panic!("expected SQL error, got {:?}", other),
    }
}

#[test]
fn test_transactions_and_autocommit() {
    let db = people();
    assert!(db.is_autocommit().unwrap());
    db.execute("BEGIN", &[]).unwrap();
    assert!(!db.is_autocommit().unwrap());
    db.execute("INSERT INTO people(name) VALUES ('tx')", &[])
        .unwrap();
    db.execute("ROLLBACK", &[]).unwrap();
    assert!(db.is_autocommit().unwrap());
    let rows = db.select("SELECT count(*) FROM people", &[]).unwrap();
    assert_eq!(rows.row(0).unwrap().get::<i64>(0).unwrap(), 0);
}

#[test]
fn test_prepare_all_then_run() {
    let db = people();
    let mut statements = db
        .prepare_all(
            "INSERT INTO people(name) VALUES ('a'); -- first\n\
             INSERT INTO people(name) VALUES ('b'); /* second */",
        )
        .unwrap();
    assert_eq!(statements.len(), 2);
    for stmt in statements.iter_mut() {
        stmt.execute(&[]).unwrap();
    }
    let rows = db.select("SELECT count(*) FROM people", &[]).unwrap();
    assert_eq!(rows.row(0).unwrap().get::<i64>(0).unwrap(), 2);
}

#[test]
fn test_row_to_map() {
    let db = people();
    let rows = db.select("SELECT 1 AS one, 'two' AS two", &[]).unwrap();
    let map = rows.row(0).unwrap().to_map();
    assert_eq!(map["one"], Value::Integer(1));
    assert_eq!(map["two"], Value::Text("two".into()));
}

#[test]
fn test_dispose_twice_and_use_after() {
    let db = people();
    let mut stmt = db.prepare("SELECT name FROM people").unwrap();
    db.dispose().unwrap();
    db.dispose().unwrap();
    assert!(matches!(db.select("SELECT 1", &[]), Err(Error::Disposed)));
    assert!(matches!(db.prepare("SELECT 1"), Err(Error::Disposed)));
    assert!(matches!(stmt.execute(&[]), Err(Error::Disposed)));
    assert!(matches!(db.user_version(), Err(Error::Disposed)));
}
