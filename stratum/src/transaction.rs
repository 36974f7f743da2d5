//! Transaction lifecycle: begin, commit, abort, and the static
//! checkpoint. The manager owns the process-wide transaction map, drives
//! the log manager on every lifecycle event and replays the in-memory
//! write-set in reverse on abort. It is also the single place where
//! recoverable errors become `TxnAborted`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, info};

use crate::buffer_pool::BufferPool;
use crate::disk::DiskManager;
use crate::engine::Registry;
use crate::error::{EngineError, Result};
use crate::lock::{LockDataId, LockManager};
use crate::page::Rid;
use crate::wal::{LogManager, LogPayload};
use crate::TxnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Default,
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    Insert,
    Delete,
    Update,
}

/// One entry of a transaction's write-set, carrying the images needed to
/// invert the operation on abort.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub wtype: WriteType,
    pub table: String,
    pub rid: Rid,
    pub old: Option<Vec<u8>>,
    pub new: Option<Vec<u8>>,
}

/// A transaction: id (doubling as wound-wait priority), state, write-set
/// and lock-set.
pub struct Transaction {
    id: TxnId,
    state: Mutex<TxnState>,
    write_set: Mutex<Vec<WriteRecord>>,
    lock_set: Mutex<HashSet<LockDataId>>,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: Mutex::new(TxnState::Default),
            write_set: Mutex::new(Vec::new()),
            lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: TxnState) {
        *self.state.lock().unwrap() = state;
    }

    pub(crate) fn add_lock(&self, id: LockDataId) {
        self.lock_set.lock().unwrap().insert(id);
    }

    pub(crate) fn take_lock_set(&self) -> Vec<LockDataId> {
        self.lock_set.lock().unwrap().drain().collect()
    }

    pub(crate) fn add_write(&self, record: WriteRecord) {
        self.write_set.lock().unwrap().push(record);
    }

    fn take_write_set(&self) -> Vec<WriteRecord> {
        std::mem::take(&mut *self.write_set.lock().unwrap())
    }
}

struct CheckpointGate {
    active: Mutex<bool>,
    cv: Condvar,
}

/// Begins, commits and aborts transactions; coordinates the static
/// checkpoint.
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    txn_map: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    log: Arc<LogManager>,
    locks: Arc<LockManager>,
    registry: Arc<Registry>,
    checkpoint_gate: CheckpointGate,
}

impl TransactionManager {
    pub fn new(
        first_txn_id: TxnId,
        disk: Arc<DiskManager>,
        pool: Arc<BufferPool>,
        log: Arc<LogManager>,
        locks: Arc<LockManager>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            next_txn_id: AtomicU64::new(first_txn_id),
            txn_map: Mutex::new(HashMap::new()),
            disk,
            pool,
            log,
            locks,
            registry,
            checkpoint_gate: CheckpointGate {
                active: Mutex::new(false),
                cv: Condvar::new(),
            },
        }
    }

    /// Starts a transaction: assign the next id, log BEGIN, enter the
    /// transaction map in GROWING state. Blocks while a checkpoint is
    /// quiescing the engine.
    pub fn begin(&self) -> Result<Arc<Transaction>> {
        {
            let mut active = self.checkpoint_gate.active.lock().unwrap();
            while *active {
                active = self.checkpoint_gate.cv.wait(active).unwrap();
            }
        }
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(id));
        txn.set_state(TxnState::Growing);
        self.log.append(id, LogPayload::Begin)?;
        self.txn_map.lock().unwrap().insert(id, txn.clone());
        debug!("txn {id} began");
        Ok(txn)
    }

    /// Commits: release every lock, clear the sets, log COMMIT and flush.
    /// Effects are already on the data pages; the write-set existed only
    /// to support abort.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        txn.set_state(TxnState::Shrinking);
        self.locks.release_all(txn);
        txn.take_write_set();
        self.log.append(txn.id(), LogPayload::Commit)?;
        self.log.flush()?;
        txn.set_state(TxnState::Committed);
        self.txn_map.lock().unwrap().remove(&txn.id());
        self.log.forget_txn(txn.id());
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Aborts: replay the write-set newest-first, inverting each effect
    /// on the table and on every index over it, then release locks, log
    /// ABORT and flush.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<()> {
        let write_set = txn.take_write_set();
        for write in write_set.into_iter().rev() {
            self.undo_write(&write)?;
        }
        txn.set_state(TxnState::Shrinking);
        self.locks.release_all(txn);
        self.log.append(txn.id(), LogPayload::Abort)?;
        self.log.flush()?;
        txn.set_state(TxnState::Aborted);
        self.txn_map.lock().unwrap().remove(&txn.id());
        self.log.forget_txn(txn.id());
        debug!("txn {} aborted", txn.id());
        Ok(())
    }

    fn undo_write(&self, write: &WriteRecord) -> Result<()> {
        let table = self.registry.open_table(&write.table)?;
        let indexes = self.registry.indexes_of(&write.table);
        match write.wtype {
            WriteType::Insert => {
                let new = write.new.as_ref().ok_or_else(|| {
                    EngineError::Internal("insert write record without new image".into())
                })?;
                table.delete_record(write.rid)?;
                for entry in &indexes {
                    entry.index.delete_entry(&entry.key_of(new))?;
                }
            }
            WriteType::Delete => {
                let old = write.old.as_ref().ok_or_else(|| {
                    EngineError::Internal("delete write record without old image".into())
                })?;
                table.insert_at(write.rid, old)?;
                for entry in &indexes {
                    entry.index.insert_entry(&entry.key_of(old), write.rid)?;
                }
            }
            WriteType::Update => {
                let old = write.old.as_ref().ok_or_else(|| {
                    EngineError::Internal("update write record without old image".into())
                })?;
                let new = write.new.as_ref().ok_or_else(|| {
                    EngineError::Internal("update write record without new image".into())
                })?;
                table.update_record(write.rid, old)?;
                for entry in &indexes {
                    // The key may have changed: drop the new one, restore
                    // the old one.
                    let old_key = entry.key_of(old);
                    let new_key = entry.key_of(new);
                    if old_key != new_key {
                        entry.index.delete_entry(&new_key)?;
                        entry.index.insert_entry(&old_key, write.rid)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Maps a recoverable failure to an abort plus `TxnAborted`; anything
    /// else passes through.
    pub fn catch(&self, txn: &Arc<Transaction>, err: EngineError) -> EngineError {
        if err.is_recoverable() {
            let reason = err.to_string();
            if let Err(abort_err) = self.abort(txn) {
                return abort_err;
            }
            return EngineError::TxnAborted {
                txn_id: txn.id(),
                reason,
            };
        }
        err
    }

    pub fn active_txns(&self) -> Vec<Arc<Transaction>> {
        self.txn_map.lock().unwrap().values().cloned().collect()
    }

    /// Static checkpoint: quiesce by aborting every in-flight transaction
    /// (except the initiator), log CHECKPOINT, flush the log and every
    /// dirty page, and record the checkpoint LSN in the start file.
    pub fn checkpoint(&self, initiator: Option<&Arc<Transaction>>) -> Result<()> {
        {
            let mut active = self.checkpoint_gate.active.lock().unwrap();
            while *active {
                active = self.checkpoint_gate.cv.wait(active).unwrap();
            }
            *active = true;
        }
        let result = self.checkpoint_inner(initiator);
        {
            let mut active = self.checkpoint_gate.active.lock().unwrap();
            *active = false;
            self.checkpoint_gate.cv.notify_all();
        }
        result
    }

    fn checkpoint_inner(&self, initiator: Option<&Arc<Transaction>>) -> Result<()> {
        let in_flight: Vec<Arc<Transaction>> = self
            .active_txns()
            .into_iter()
            .filter(|t| initiator.map_or(true, |i| i.id() != t.id()))
            .collect();
        for txn in &in_flight {
            info!("checkpoint aborting in-flight txn {}", txn.id());
            self.abort(txn)?;
        }

        let lsn = self.log.append(crate::INVALID_TXN, LogPayload::Checkpoint)?;
        self.log.flush()?;
        self.registry.flush_all()?;
        self.pool.flush_everything()?;
        self.registry.sync_all()?;
        self.disk.write_start_file(lsn as i64)?;
        info!("checkpoint complete at lsn {lsn}");
        Ok(())
    }
}
