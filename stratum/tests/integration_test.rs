mod common;

use common::{id_index, init_logging, row, row_id, row_name, RECORD_SIZE};
use stratum::btree::{ColType, Value};
use stratum::engine::{Engine, IndexCol, IndexDef};
use stratum::error::EngineError;
use stratum::page::Rid;
use stratum::transaction::TxnState;
use tempfile::tempdir;

#[test]
fn test_abort_rolls_back_update_and_delete() {
    init_logging();
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    engine.create_table("emp", RECORD_SIZE).unwrap();

    let txn = engine.begin().unwrap();
    let rid = engine.insert(&txn, "emp", &row(1, "a")).unwrap();
    engine.commit(&txn).unwrap();

    let txn = engine.begin().unwrap();
    engine.update(&txn, "emp", rid, &row(1, "b")).unwrap();
    engine.delete(&txn, "emp", rid).unwrap();
    engine.abort(&txn).unwrap();
    assert_eq!(txn.state(), TxnState::Aborted);

    let txn = engine.begin().unwrap();
    let record = engine.get(&txn, "emp", rid).unwrap().unwrap();
    engine.commit(&txn).unwrap();
    assert_eq!(row_id(&record), 1);
    assert_eq!(row_name(&record), "a");
}

#[test]
fn test_abort_restores_indexes_across_key_change() {
    init_logging();
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    engine.create_table("emp", RECORD_SIZE).unwrap();
    engine.create_index("emp", id_index("by_id", None)).unwrap();

    let txn = engine.begin().unwrap();
    let rid = engine.insert(&txn, "emp", &row(5, "a")).unwrap();
    engine.commit(&txn).unwrap();

    // Update moves the indexed key from 5 to 9, then the abort moves it
    // back.
    let txn = engine.begin().unwrap();
    engine.update(&txn, "emp", rid, &row(9, "a")).unwrap();
    engine.abort(&txn).unwrap();

    let txn = engine.begin().unwrap();
    assert_eq!(
        engine.index_lookup(&txn, "emp", "by_id", &[Value::Int(5)]).unwrap(),
        vec![rid]
    );
    assert!(engine
        .index_lookup(&txn, "emp", "by_id", &[Value::Int(9)])
        .unwrap()
        .is_empty());
    engine.commit(&txn).unwrap();
}

#[test]
fn test_page_counters_match_bitmap_popcount() {
    init_logging();
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    engine.create_table("emp", RECORD_SIZE).unwrap();

    let txn = engine.begin().unwrap();
    for i in 0..600 {
        engine.insert(&txn, "emp", &row(i, "r")).unwrap();
    }
    engine.commit(&txn).unwrap();

    let txn = engine.begin().unwrap();
    for (rid, _) in engine.scan_all(&txn, "emp").unwrap().iter().step_by(3) {
        engine.delete(&txn, "emp", *rid).unwrap();
    }
    engine.commit(&txn).unwrap();

    let table = engine.open_table("emp").unwrap();
    for page_no in 1..table.num_pages() {
        let (counted, popcount) = table.page_record_count(page_no).unwrap();
        assert_eq!(counted as usize, popcount, "page {page_no}");
    }
}

#[test]
fn test_catalog_errors() {
    init_logging();
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();

    assert!(matches!(
        engine.open_table("ghost"),
        Err(EngineError::TableNotFound(_))
    ));

    engine.create_table("emp", RECORD_SIZE).unwrap();
    assert!(matches!(
        engine.create_table("emp", RECORD_SIZE),
        Err(EngineError::TableExists(_))
    ));

    engine.create_index("emp", id_index("by_id", None)).unwrap();
    assert!(matches!(
        engine.create_index("emp", id_index("by_id", None)),
        Err(EngineError::IndexExists(_))
    ));

    let txn = engine.begin().unwrap();
    assert!(matches!(
        engine.index_lookup(&txn, "emp", "ghost", &[Value::Int(1)]),
        Err(EngineError::IndexNotFound(_))
    ));
    engine.commit(&txn).unwrap();

    // A column definition outside the record is rejected.
    let bad = IndexDef {
        name: "oob".into(),
        cols: vec![IndexCol {
            col_type: ColType::Int,
            len: 4,
            offset: RECORD_SIZE as u32 - 2,
        }],
        order: None,
    };
    assert!(matches!(
        engine.create_index("emp", bad),
        Err(EngineError::ColumnNotFound(_))
    ));

    engine.drop_index("emp", "by_id").unwrap();
    assert!(matches!(
        engine.drop_index("emp", "by_id"),
        Err(EngineError::IndexNotFound(_))
    ));
}

#[test]
fn test_update_of_missing_record_fails() {
    init_logging();
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    engine.create_table("emp", RECORD_SIZE).unwrap();

    let txn = engine.begin().unwrap();
    engine.insert(&txn, "emp", &row(1, "a")).unwrap();
    engine.commit(&txn).unwrap();

    let txn = engine.begin().unwrap();
    match engine.update(&txn, "emp", Rid::new(1, 7), &row(9, "z")) {
        Err(EngineError::RecordNotFound(rid)) => assert_eq!(rid, Rid::new(1, 7)),
        other => panic!("expected RecordNotFound, got {other:?}"),
    }
    engine.commit(&txn).unwrap();
}

#[test]
fn test_string_overflow_in_index_key() {
    init_logging();
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    engine.create_table("emp", RECORD_SIZE).unwrap();
    engine
        .create_index(
            "emp",
            IndexDef {
                name: "by_name".into(),
                cols: vec![IndexCol {
                    col_type: ColType::Str,
                    len: 12,
                    offset: 4,
                }],
                order: None,
            },
        )
        .unwrap();

    let txn = engine.begin().unwrap();
    match engine.index_lookup(
        &txn,
        "emp",
        "by_name",
        &[Value::Str("a name far too long for twelve bytes".into())],
    ) {
        Err(EngineError::StringOverflow { max: 12, .. }) => {}
        other => panic!("expected StringOverflow, got {other:?}"),
    }
    engine.commit(&txn).unwrap();
}

#[test]
fn test_drop_table_removes_files() {
    init_logging();
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    engine.create_table("emp", RECORD_SIZE).unwrap();
    engine.create_index("emp", id_index("by_id", None)).unwrap();

    let txn = engine.begin().unwrap();
    engine.insert(&txn, "emp", &row(1, "a")).unwrap();
    engine.commit(&txn).unwrap();

    engine.drop_table("emp").unwrap();
    assert!(!dir.path().join("emp.tbl").exists());
    assert!(!dir.path().join("emp.by_id.idx").exists());
    assert!(matches!(
        engine.open_table("emp"),
        Err(EngineError::TableNotFound(_))
    ));

    // The name is free again.
    engine.create_table("emp", RECORD_SIZE).unwrap();
    let txn = engine.begin().unwrap();
    assert!(engine.scan_all(&txn, "emp").unwrap().is_empty());
    engine.commit(&txn).unwrap();
}

#[test]
fn test_index_survives_clean_restart() {
    init_logging();
    let dir = tempdir().unwrap();
    let expected_rid;
    {
        let engine = Engine::open(dir.path()).unwrap();
        engine.create_table("emp", RECORD_SIZE).unwrap();
        engine.create_index("emp", id_index("by_id", None)).unwrap();
        let txn = engine.begin().unwrap();
        expected_rid = engine.insert(&txn, "emp", &row(3, "c")).unwrap();
        engine.commit(&txn).unwrap();
        engine.shutdown().unwrap();
    }

    let engine = Engine::open(dir.path()).unwrap();
    engine.open_index("emp", id_index("by_id", None)).unwrap();
    let txn = engine.begin().unwrap();
    assert_eq!(
        engine.index_lookup(&txn, "emp", "by_id", &[Value::Int(3)]).unwrap(),
        vec![expected_rid]
    );
    engine.commit(&txn).unwrap();
}

#[test]
fn test_rebuild_index_reconciles_after_crash() {
    init_logging();
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(dir.path()).unwrap();
        engine.create_table("emp", RECORD_SIZE).unwrap();
        engine.create_index("emp", id_index("by_id", None)).unwrap();
        let txn = engine.begin().unwrap();
        engine.insert(&txn, "emp", &row(1, "a")).unwrap();
        engine.insert(&txn, "emp", &row(2, "b")).unwrap();
        engine.commit(&txn).unwrap();
        engine.simulate_crash();
    }

    // Table pages come back through the WAL; index pages are not logged,
    // so the index is rebuilt from the recovered table.
    let engine = Engine::open(dir.path()).unwrap();
    engine.open_index("emp", id_index("by_id", None)).unwrap();
    engine.rebuild_index("emp", "by_id").unwrap();

    let txn = engine.begin().unwrap();
    let hits = engine
        .index_range(&txn, "emp", "by_id", None, None)
        .unwrap();
    assert_eq!(hits.len(), 2);
    engine.commit(&txn).unwrap();
}
