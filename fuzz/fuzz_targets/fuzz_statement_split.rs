#![no_main]
use libfuzzer_sys::fuzz_target;
use sqlbridge_rs::{Database, Error};

// Arbitrary text must either split cleanly or fail with a structured error
fuzz_target!(|input: &[u8]| {
    let Ok(sql) = std::str::from_utf8(input) else {
        return;
    };
    let db = match Database::open_in_memory() {
        Ok(db) => db,
        Err(_) => return,
    };

    match db.prepare_all(sql) {
        Ok(statements) => {
            let mut last = 0;
            for stmt in &statements {
                assert!(stmt.tail_offset() > last);
                assert_eq!(&sql[stmt.tail_offset()..], stmt.tail());
                last = stmt.tail_offset();
            }
        }
        Err(Error::Sql(_)) | Err(Error::InvalidArgument(_)) => {}
        Err(e) => panic!("unexpected error: {:?}", e),
    }

    match db.prepare_strict(sql) {
        Ok(stmt) => assert!(!stmt.sql().is_empty()),
        Err(Error::Sql(_)) | Err(Error::InvalidArgument(_)) => {}
        Err(e) => panic!("unexpected error: {:?}", e),
    }
});
