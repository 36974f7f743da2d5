//! ARIES-style crash recovery, run once at startup before the engine
//! accepts transactions. Analyze scans forward from the last checkpoint
//! rebuilding the active transaction table and per-page redo/undo lists;
//! redo reapplies physical effects LSN-ascending through the tolerant
//! record-store variants; undo strips surviving uncommitted effects
//! LSN-descending.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use log::{info, warn};

use crate::disk::DiskManager;
use crate::engine::Registry;
use crate::error::Result;
use crate::wal::{LogManager, LogPayload, LogRecord, RECORD_HEADER_SIZE};
use crate::{Lsn, PageNo, TxnId};

/// Lists of log positions touching one `(table, page)`, in scan order.
type PageLogs = BTreeMap<(String, PageNo), Vec<(Lsn, TxnId)>>;

pub struct RecoverySummary {
    pub touched_tables: HashSet<String>,
    pub redone: usize,
    pub undone: usize,
    pub aborted_txns: Vec<TxnId>,
    /// Next transaction id safe to assign: one past the highest id
    /// anywhere in the log, so restarted engines never reuse ids.
    pub next_txn_id: TxnId,
}

pub struct RecoveryManager {
    disk: Arc<DiskManager>,
    log: Arc<LogManager>,
    registry: Arc<Registry>,
}

struct Analysis {
    att: HashSet<TxnId>,
    redo_list: PageLogs,
    undo_list: PageLogs,
    touched_tables: HashSet<String>,
}

impl RecoveryManager {
    pub fn new(disk: Arc<DiskManager>, log: Arc<LogManager>, registry: Arc<Registry>) -> Self {
        Self {
            disk,
            log,
            registry,
        }
    }

    /// Runs the three phases and finishes the log: every transaction
    /// still in the ATT gets an ABORT record.
    pub fn run(&self) -> Result<RecoverySummary> {
        let log_bytes = self.read_log()?;
        let next_txn_id = highest_txn_id(&log_bytes).map_or(0, |id| id + 1);
        let analysis = self.analyze(&log_bytes)?;
        let redone = self.redo(&log_bytes, &analysis)?;
        let undone = self.undo(&log_bytes, &analysis)?;

        let mut aborted = Vec::new();
        for &txn_id in &analysis.att {
            self.log.append(txn_id, LogPayload::Abort)?;
            aborted.push(txn_id);
        }
        if !aborted.is_empty() {
            self.log.flush()?;
        }
        if redone + undone > 0 {
            info!(
                "recovery replayed {redone} and undid {undone} operations over {} tables",
                analysis.touched_tables.len()
            );
        }
        Ok(RecoverySummary {
            touched_tables: analysis.touched_tables,
            redone,
            undone,
            aborted_txns: aborted,
            next_txn_id,
        })
    }

    fn read_log(&self) -> Result<Vec<u8>> {
        let size = self.disk.log_size()? as usize;
        let mut buf = vec![0u8; size];
        let read = self.disk.read_log(&mut buf, 0)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// The starting offset: just past the checkpoint named by the start
    /// file, or the beginning of the log.
    fn start_offset(&self, log_bytes: &[u8]) -> Result<usize> {
        let checkpoint_lsn = self.disk.read_start_file()?;
        if checkpoint_lsn < 0 {
            return Ok(0);
        }
        let offset = checkpoint_lsn as usize;
        match decode_at(log_bytes, offset) {
            Some(record) if matches!(record.payload, LogPayload::Checkpoint) => {
                Ok(offset + record.total_len())
            }
            _ => {
                warn!("start file names lsn {offset} but no checkpoint record lives there");
                Ok(0)
            }
        }
    }

    fn analyze(&self, log_bytes: &[u8]) -> Result<Analysis> {
        let mut analysis = Analysis {
            att: HashSet::new(),
            redo_list: BTreeMap::new(),
            undo_list: BTreeMap::new(),
            touched_tables: HashSet::new(),
        };
        let mut offset = self.start_offset(log_bytes)?;

        while offset + RECORD_HEADER_SIZE <= log_bytes.len() {
            let Some(record) = decode_at(log_bytes, offset) else {
                // Torn tail: the header advanced past the flushed bytes.
                break;
            };
            match &record.payload {
                LogPayload::Begin => {
                    analysis.att.insert(record.txn_id);
                }
                LogPayload::Commit => {
                    analysis.att.remove(&record.txn_id);
                    for entries in analysis.undo_list.values_mut() {
                        entries.retain(|&(_, t)| t != record.txn_id);
                    }
                }
                LogPayload::Abort => {
                    analysis.att.remove(&record.txn_id);
                }
                LogPayload::Insert { table, rid, .. }
                | LogPayload::Delete { table, rid, .. }
                | LogPayload::Update { table, rid, .. } => {
                    if analysis.att.contains(&record.txn_id) {
                        let key = (table.clone(), rid.page_no);
                        let entry = (record.lsn, record.txn_id);
                        analysis.redo_list.entry(key.clone()).or_default().push(entry);
                        analysis.undo_list.entry(key).or_default().push(entry);
                        analysis.touched_tables.insert(table.clone());
                    }
                }
                LogPayload::Header { .. } | LogPayload::Checkpoint => {}
            }
            offset += record.total_len();
        }
        Ok(analysis)
    }

    /// Reapplies every surviving physical effect, page by page in LSN
    /// order. The record-store recovery variants make this idempotent:
    /// pages are created on demand and slot-state mismatches are no-ops.
    fn redo(&self, log_bytes: &[u8], analysis: &Analysis) -> Result<usize> {
        let mut redone = 0;
        for ((table_name, _page_no), entries) in &analysis.redo_list {
            let Some(table) = self.open_if_present(table_name)? else {
                continue;
            };
            for &(lsn, _) in entries {
                let Some(record) = decode_at(log_bytes, lsn as usize) else {
                    continue;
                };
                match record.payload {
                    LogPayload::Insert { rid, record, .. } => table.insert_at(rid, &record)?,
                    LogPayload::Update { rid, new, .. } => table.update_at(rid, &new)?,
                    LogPayload::Delete { rid, .. } => table.delete_at(rid)?,
                    _ => continue,
                }
                redone += 1;
            }
        }
        Ok(redone)
    }

    /// Strips uncommitted effects, newest first within each page.
    fn undo(&self, log_bytes: &[u8], analysis: &Analysis) -> Result<usize> {
        let mut undone = 0;
        for ((table_name, _page_no), entries) in &analysis.undo_list {
            let Some(table) = self.open_if_present(table_name)? else {
                continue;
            };
            for &(lsn, _) in entries.iter().rev() {
                let Some(record) = decode_at(log_bytes, lsn as usize) else {
                    continue;
                };
                match record.payload {
                    LogPayload::Insert { rid, .. } => table.delete_at(rid)?,
                    LogPayload::Update { rid, old, .. } => table.update_at(rid, &old)?,
                    LogPayload::Delete { rid, record, .. } => table.insert_at(rid, &record)?,
                    _ => continue,
                }
                undone += 1;
            }
        }
        Ok(undone)
    }

    fn open_if_present(&self, table: &str) -> Result<Option<Arc<crate::table::TableFile>>> {
        match self.registry.open_table(table) {
            Ok(t) => Ok(Some(t)),
            Err(crate::error::EngineError::TableNotFound(_)) => {
                warn!("log references table {table} that no longer exists");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Highest transaction id anywhere in the log, scanned from the very
/// beginning: ids must stay unique across restarts even when the
/// analyze pass starts later, at a checkpoint.
fn highest_txn_id(log_bytes: &[u8]) -> Option<TxnId> {
    let mut highest = None;
    let mut offset = 0;
    while offset + RECORD_HEADER_SIZE <= log_bytes.len() {
        let Some(record) = decode_at(log_bytes, offset) else {
            break;
        };
        if record.txn_id != crate::INVALID_TXN {
            highest = Some(highest.map_or(record.txn_id, |h: TxnId| h.max(record.txn_id)));
        }
        offset += record.total_len();
    }
    highest
}

/// Decodes the record starting at `offset`, returning `None` for
/// anything that cannot be a live record (torn tail, zeroed gap, or an
/// LSN that disagrees with its own offset).
fn decode_at(log_bytes: &[u8], offset: usize) -> Option<LogRecord> {
    if offset + RECORD_HEADER_SIZE > log_bytes.len() {
        return None;
    }
    let record = LogRecord::decode(&log_bytes[offset..]).ok()?;
    if record.lsn != offset as Lsn {
        return None;
    }
    Some(record)
}
