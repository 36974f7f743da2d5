mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{init_logging, row, row_id, RECORD_SIZE};
use stratum::engine::Engine;
use stratum::error::EngineError;
use stratum::transaction::TxnState;
use tempfile::tempdir;

#[test]
fn test_wound_wait_younger_waits_older_wounds() {
    init_logging();
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::open(dir.path()).unwrap());
    engine.create_table("t1", RECORD_SIZE).unwrap();
    engine.create_table("t2", RECORD_SIZE).unwrap();

    // Older transaction takes X on t1.
    let older = engine.begin().unwrap();
    engine.insert(&older, "t1", &row(1, "old")).unwrap();

    let engine2 = engine.clone();
    let younger_thread = thread::spawn(move || {
        // Younger takes X on t2, then blocks behind the older holder of
        // t1 (younger requesters wait, they are not wounded).
        let younger = engine2.begin().unwrap();
        engine2.insert(&younger, "t2", &row(2, "you")).unwrap();
        let result = engine2.insert(&younger, "t1", &row(3, "you"));
        (younger, result)
    });

    // Let the younger transaction reach its wait.
    thread::sleep(Duration::from_millis(200));

    // The older transaction now needs t2, held by the younger: the
    // younger is wounded and its blocked request dies with
    // DeadlockPrevention; the older proceeds.
    engine.insert(&older, "t2", &row(4, "old")).unwrap();
    engine.commit(&older).unwrap();

    let (younger, result) = younger_thread.join().unwrap();
    match result {
        Err(EngineError::TxnAborted { .. }) => {}
        other => panic!("younger should be wounded, got {other:?}"),
    }
    assert_eq!(younger.state(), TxnState::Aborted);

    // The younger transaction's t2 insert was rolled back; only the
    // older transaction's rows remain.
    let txn = engine.begin().unwrap();
    let t1_ids: Vec<i32> = engine
        .scan_all(&txn, "t1")
        .unwrap()
        .iter()
        .map(|(_, r)| row_id(r))
        .collect();
    let t2_ids: Vec<i32> = engine
        .scan_all(&txn, "t2")
        .unwrap()
        .iter()
        .map(|(_, r)| row_id(r))
        .collect();
    engine.commit(&txn).unwrap();
    assert_eq!(t1_ids, vec![1]);
    assert_eq!(t2_ids, vec![4]);
}

#[test]
fn test_conflicting_writers_serialize() {
    init_logging();
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::open(dir.path()).unwrap());
    engine.create_table("acct", RECORD_SIZE).unwrap();

    let txn = engine.begin().unwrap();
    let rid = engine.insert(&txn, "acct", &row(0, "bal")).unwrap();
    engine.commit(&txn).unwrap();

    const THREADS: usize = 4;
    const INCREMENTS: usize = 25;
    thread::scope(|scope| {
        for _ in 0..THREADS {
            let engine = engine.clone();
            scope.spawn(move || {
                let mut done = 0;
                while done < INCREMENTS {
                    let txn = match engine.begin() {
                        Ok(t) => t,
                        Err(e) => panic!("begin failed: {e}"),
                    };
                    let step = (|| {
                        let current = engine
                            .get(&txn, "acct", rid)?
                            .expect("the balance row exists");
                        let next = row(row_id(&current) + 1, "bal");
                        engine.update(&txn, "acct", rid, &next)?;
                        engine.commit(&txn)
                    })();
                    match step {
                        Ok(()) => done += 1,
                        // Wounded: retry the whole transaction.
                        Err(EngineError::TxnAborted { .. }) => {}
                        Err(e) => panic!("unexpected failure: {e}"),
                    }
                }
            });
        }
    });

    let txn = engine.begin().unwrap();
    let balance = engine.get(&txn, "acct", rid).unwrap().unwrap();
    engine.commit(&txn).unwrap();
    assert_eq!(row_id(&balance) as usize, THREADS * INCREMENTS);
}

#[test]
fn test_readers_share_the_table() {
    init_logging();
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::open(dir.path()).unwrap());
    engine.create_table("emp", RECORD_SIZE).unwrap();

    let txn = engine.begin().unwrap();
    for i in 0..50 {
        engine.insert(&txn, "emp", &row(i, "r")).unwrap();
    }
    engine.commit(&txn).unwrap();

    thread::scope(|scope| {
        for _ in 0..6 {
            let engine = engine.clone();
            scope.spawn(move || {
                let txn = engine.begin().unwrap();
                let rows = engine.scan_all(&txn, "emp").unwrap();
                assert_eq!(rows.len(), 50);
                engine.commit(&txn).unwrap();
            });
        }
    });
}

#[test]
fn test_checkpoint_aborts_in_flight_transactions() {
    init_logging();
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    engine.create_table("emp", RECORD_SIZE).unwrap();

    let txn = engine.begin().unwrap();
    engine.insert(&txn, "emp", &row(1, "a")).unwrap();

    engine.checkpoint().unwrap();
    assert_eq!(txn.state(), TxnState::Aborted);

    let txn = engine.begin().unwrap();
    assert!(engine.scan_all(&txn, "emp").unwrap().is_empty());
    engine.commit(&txn).unwrap();
}
