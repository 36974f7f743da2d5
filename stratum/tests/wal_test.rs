mod common;

use std::io::Write;

use common::{init_logging, row, row_id, RECORD_SIZE};
use serial_test::serial;
use stratum::engine::Engine;
use stratum::error::EngineError;
use stratum::failpoint;
use tempfile::tempdir;

#[test]
fn test_garbage_log_tail_is_ignored() {
    init_logging();
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(dir.path()).unwrap();
        engine.create_table("emp", RECORD_SIZE).unwrap();
        let txn = engine.begin().unwrap();
        engine.insert(&txn, "emp", &row(1, "a")).unwrap();
        engine.commit(&txn).unwrap();
        engine.simulate_crash();
    }

    // A torn write left junk past the last complete record.
    let mut log = std::fs::OpenOptions::new()
        .append(true)
        .open(dir.path().join("db.log"))
        .unwrap();
    log.write_all(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x13, 0x37]).unwrap();
    drop(log);

    let engine = Engine::open(dir.path()).unwrap();
    let txn = engine.begin().unwrap();
    let rows = engine.scan_all(&txn, "emp").unwrap();
    engine.commit(&txn).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(row_id(&rows[0].1), 1);
}

#[test]
#[serial]
fn test_log_write_failure_surfaces_and_engine_stays_usable() {
    init_logging();
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    engine.create_table("emp", RECORD_SIZE).unwrap();

    let txn = engine.begin().unwrap();

    failpoint::clear();
    failpoint::enable("disk.write_log");
    let result = engine.insert(&txn, "emp", &row(1, "a"));
    failpoint::clear();

    match result {
        Err(EngineError::Io(_)) => {}
        other => panic!("expected the I/O error verbatim, got {other:?}"),
    }

    // The failed operation's partial effect rolls back with the
    // transaction, and the engine keeps accepting work.
    engine.abort(&txn).unwrap();

    let txn = engine.begin().unwrap();
    engine.insert(&txn, "emp", &row(2, "b")).unwrap();
    engine.commit(&txn).unwrap();

    let txn = engine.begin().unwrap();
    let rows = engine.scan_all(&txn, "emp").unwrap();
    engine.commit(&txn).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(row_id(&rows[0].1), 2);
}

#[test]
#[serial]
fn test_commit_fails_cleanly_when_log_flush_fails() {
    init_logging();
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    engine.create_table("emp", RECORD_SIZE).unwrap();

    let txn = engine.begin().unwrap();
    engine.insert(&txn, "emp", &row(1, "a")).unwrap();

    failpoint::clear();
    failpoint::enable("disk.write_log");
    let result = engine.commit(&txn);
    failpoint::clear();
    assert!(matches!(result, Err(EngineError::Io(_))));

    // Retrying once the disk recovers succeeds.
    engine.commit(&txn).unwrap();

    let txn = engine.begin().unwrap();
    let rows = engine.scan_all(&txn, "emp").unwrap();
    engine.commit(&txn).unwrap();
    assert_eq!(rows.len(), 1);
}
