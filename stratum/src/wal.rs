//! The Write-Ahead Log. Records are assigned monotonically increasing
//! LSNs that double as byte offsets into the log file: the record with
//! LSN `l` starts exactly at byte `l`. Offset 0 holds a HEADER record
//! carrying the next LSN to assign, rewritten as the log grows and
//! reloaded on startup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut};
use log::debug;

use crate::disk::DiskManager;
use crate::error::{EngineError, Result};
use crate::page::Rid;
use crate::{Lsn, TxnId, INVALID_LSN, INVALID_TXN};

/// Capacity of the in-memory log buffer.
pub const LOG_BUFFER_SIZE: usize = 1 << 20;

/// Fixed size of every record's header:
/// `log_type u8, lsn u64, log_tot_len u32, txn_id u64, prev_lsn u64`.
pub const RECORD_HEADER_SIZE: usize = 1 + 8 + 4 + 8 + 8;

/// Size of the HEADER record that occupies offset 0.
pub const HEADER_RECORD_SIZE: usize = RECORD_HEADER_SIZE + 8 + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogType {
    Begin = 0,
    Commit = 1,
    Abort = 2,
    Insert = 3,
    Delete = 4,
    Update = 5,
    Checkpoint = 6,
    Header = 7,
}

impl LogType {
    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => LogType::Begin,
            1 => LogType::Commit,
            2 => LogType::Abort,
            3 => LogType::Insert,
            4 => LogType::Delete,
            5 => LogType::Update,
            6 => LogType::Checkpoint,
            7 => LogType::Header,
            other => {
                return Err(EngineError::Internal(format!(
                    "unknown log record type {other}"
                )))
            }
        })
    }
}

/// Typed body of a log record.
#[derive(Debug, Clone, PartialEq)]
pub enum LogPayload {
    Begin,
    Commit,
    Abort,
    Checkpoint,
    Insert {
        table: String,
        rid: Rid,
        record: Vec<u8>,
    },
    Delete {
        table: String,
        rid: Rid,
        record: Vec<u8>,
    },
    Update {
        table: String,
        rid: Rid,
        old: Vec<u8>,
        new: Vec<u8>,
    },
    Header {
        global_lsn: Lsn,
        persist_lsn: Lsn,
        buffer_size: u64,
    },
}

impl LogPayload {
    pub fn log_type(&self) -> LogType {
        match self {
            LogPayload::Begin => LogType::Begin,
            LogPayload::Commit => LogType::Commit,
            LogPayload::Abort => LogType::Abort,
            LogPayload::Checkpoint => LogType::Checkpoint,
            LogPayload::Insert { .. } => LogType::Insert,
            LogPayload::Delete { .. } => LogType::Delete,
            LogPayload::Update { .. } => LogType::Update,
            LogPayload::Header { .. } => LogType::Header,
        }
    }

    fn body_len(&self) -> usize {
        fn dml_len(table: &str, record: &[u8]) -> usize {
            4 + table.len() + 8 + 4 + record.len()
        }
        match self {
            LogPayload::Begin
            | LogPayload::Commit
            | LogPayload::Abort
            | LogPayload::Checkpoint => 0,
            LogPayload::Insert { table, record, .. }
            | LogPayload::Delete { table, record, .. } => dml_len(table, record),
            LogPayload::Update {
                table, old, new, ..
            } => 4 + table.len() + 8 + 4 + old.len() + 4 + new.len(),
            LogPayload::Header { .. } => 24,
        }
    }
}

/// One log record: common header plus typed body. Never mutated after
/// creation.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub payload: LogPayload,
}

impl LogRecord {
    pub fn total_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.body_len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_len());
        buf.put_u8(self.payload.log_type() as u8);
        buf.put_u64_le(self.lsn);
        buf.put_u32_le(self.total_len() as u32);
        buf.put_u64_le(self.txn_id);
        buf.put_u64_le(self.prev_lsn);
        match &self.payload {
            LogPayload::Begin
            | LogPayload::Commit
            | LogPayload::Abort
            | LogPayload::Checkpoint => {}
            LogPayload::Insert { table, rid, record }
            | LogPayload::Delete { table, rid, record } => {
                put_dml(&mut buf, table, *rid, record);
            }
            LogPayload::Update {
                table,
                rid,
                old,
                new,
            } => {
                buf.put_u32_le(table.len() as u32);
                buf.put_slice(table.as_bytes());
                buf.put_i32_le(rid.page_no);
                buf.put_i32_le(rid.slot_no);
                buf.put_u32_le(old.len() as u32);
                buf.put_slice(old);
                buf.put_u32_le(new.len() as u32);
                buf.put_slice(new);
            }
            LogPayload::Header {
                global_lsn,
                persist_lsn,
                buffer_size,
            } => {
                buf.put_u64_le(*global_lsn);
                buf.put_u64_le(*persist_lsn);
                buf.put_u64_le(*buffer_size);
            }
        }
        debug_assert_eq!(buf.len(), self.total_len());
        buf
    }

    /// Decodes the record starting at `buf[0]`. Fails on truncated or
    /// malformed input.
    pub fn decode(buf: &[u8]) -> Result<LogRecord> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(EngineError::Internal("truncated log record header".into()));
        }
        let mut cursor = buf;
        let log_type = LogType::from_tag(cursor.get_u8())?;
        let lsn = cursor.get_u64_le();
        let total_len = cursor.get_u32_le() as usize;
        let txn_id = cursor.get_u64_le();
        let prev_lsn = cursor.get_u64_le();
        if total_len < RECORD_HEADER_SIZE || buf.len() < total_len {
            return Err(EngineError::Internal("truncated log record body".into()));
        }

        let payload = match log_type {
            LogType::Begin => LogPayload::Begin,
            LogType::Commit => LogPayload::Commit,
            LogType::Abort => LogPayload::Abort,
            LogType::Checkpoint => LogPayload::Checkpoint,
            LogType::Insert => {
                let (table, rid, record) = get_dml(&mut cursor)?;
                LogPayload::Insert { table, rid, record }
            }
            LogType::Delete => {
                let (table, rid, record) = get_dml(&mut cursor)?;
                LogPayload::Delete { table, rid, record }
            }
            LogType::Update => {
                let table = get_string(&mut cursor)?;
                if cursor.len() < 8 {
                    return Err(EngineError::Internal("truncated log record rid".into()));
                }
                let rid = Rid::new(cursor.get_i32_le(), cursor.get_i32_le());
                let old = get_bytes(&mut cursor)?;
                let new = get_bytes(&mut cursor)?;
                LogPayload::Update {
                    table,
                    rid,
                    old,
                    new,
                }
            }
            LogType::Header => {
                if cursor.len() < 24 {
                    return Err(EngineError::Internal("truncated log header record".into()));
                }
                LogPayload::Header {
                    global_lsn: cursor.get_u64_le(),
                    persist_lsn: cursor.get_u64_le(),
                    buffer_size: cursor.get_u64_le(),
                }
            }
        };
        let record = LogRecord {
            lsn,
            txn_id,
            prev_lsn,
            payload,
        };
        if record.total_len() != total_len {
            return Err(EngineError::Internal(
                "log record length disagrees with its payload".into(),
            ));
        }
        Ok(record)
    }
}

fn put_dml(buf: &mut Vec<u8>, table: &str, rid: Rid, record: &[u8]) {
    buf.put_u32_le(table.len() as u32);
    buf.put_slice(table.as_bytes());
    buf.put_i32_le(rid.page_no);
    buf.put_i32_le(rid.slot_no);
    buf.put_u32_le(record.len() as u32);
    buf.put_slice(record);
}

fn get_string(cursor: &mut &[u8]) -> Result<String> {
    let bytes = get_bytes(cursor)?;
    String::from_utf8(bytes)
        .map_err(|_| EngineError::Internal("log record table name is not utf-8".into()))
}

fn get_bytes(cursor: &mut &[u8]) -> Result<Vec<u8>> {
    if cursor.len() < 4 {
        return Err(EngineError::Internal("truncated log record field".into()));
    }
    let len = cursor.get_u32_le() as usize;
    if cursor.len() < len {
        return Err(EngineError::Internal("truncated log record field".into()));
    }
    let out = cursor[..len].to_vec();
    cursor.advance(len);
    Ok(out)
}

fn get_dml(cursor: &mut &[u8]) -> Result<(String, Rid, Vec<u8>)> {
    let table = get_string(cursor)?;
    if cursor.len() < 8 {
        return Err(EngineError::Internal("truncated log record rid".into()));
    }
    let rid = Rid::new(cursor.get_i32_le(), cursor.get_i32_le());
    let record = get_bytes(cursor)?;
    Ok((table, rid, record))
}

struct LogState {
    global_lsn: Lsn,
    persist_lsn: Lsn,
    buffer: Vec<u8>,
    buffer_start: Lsn,
    last_lsn: HashMap<TxnId, Lsn>,
}

/// Assigns LSNs, buffers serialized records and persists them to the log
/// file. One mutex serializes `append` and `flush`.
pub struct LogManager {
    disk: Arc<DiskManager>,
    state: Mutex<LogState>,
}

impl LogManager {
    /// Opens the log. An empty file gets a fresh header; otherwise the
    /// header is reloaded, the record chain walked to its true end, and
    /// any torn tail (the header may run ahead of the flushed bytes)
    /// truncated away so LSNs keep matching byte offsets.
    pub fn open(disk: Arc<DiskManager>) -> Result<Self> {
        let size = disk.log_size()?;
        let (global_lsn, persist_lsn) = if size < HEADER_RECORD_SIZE as u64 {
            let first = HEADER_RECORD_SIZE as Lsn;
            disk.truncate_log(0)?;
            write_log_header(&disk, first, first)?;
            (first, first)
        } else {
            let mut buf = vec![0u8; size as usize];
            let read = disk.read_log(&mut buf, 0)?;
            buf.truncate(read);
            let header = LogRecord::decode(&buf)?;
            if !matches!(header.payload, LogPayload::Header { .. }) {
                return Err(EngineError::Internal(
                    "log file does not start with a header record".into(),
                ));
            }

            let mut end = HEADER_RECORD_SIZE;
            while end + RECORD_HEADER_SIZE <= buf.len() {
                match LogRecord::decode(&buf[end..]) {
                    Ok(record) if record.lsn == end as Lsn => end += record.total_len(),
                    _ => break,
                }
            }
            if (end as u64) < size {
                debug!("truncating torn log tail at {end} (file had {size} bytes)");
                disk.truncate_log(end as u64)?;
            }
            write_log_header(&disk, end as Lsn, end as Lsn)?;
            (end as Lsn, end as Lsn)
        };
        debug!("log opened: global_lsn {global_lsn}, persist_lsn {persist_lsn}");
        Ok(Self {
            disk,
            state: Mutex::new(LogState {
                global_lsn,
                persist_lsn,
                buffer: Vec::with_capacity(LOG_BUFFER_SIZE),
                buffer_start: global_lsn,
                last_lsn: HashMap::new(),
            }),
        })
    }

    /// Serializes one record into the buffer, assigning its LSN and
    /// chaining it to the transaction's previous record. Flushes first
    /// when the buffer cannot hold the record.
    pub fn append(&self, txn_id: TxnId, payload: LogPayload) -> Result<Lsn> {
        let mut state = self.state.lock().unwrap();
        let lsn = state.global_lsn;
        let prev_lsn = state.last_lsn.get(&txn_id).copied().unwrap_or(INVALID_LSN);
        let record = LogRecord {
            lsn,
            txn_id,
            prev_lsn,
            payload,
        };
        let bytes = record.encode();

        if state.buffer.len() + bytes.len() > LOG_BUFFER_SIZE {
            self.flush_locked(&mut state)?;
        }
        if bytes.len() > LOG_BUFFER_SIZE {
            // Oversized record: straight to disk.
            self.disk.write_log(&bytes, lsn)?;
            state.persist_lsn = lsn + bytes.len() as Lsn;
        } else {
            state.buffer.extend_from_slice(&bytes);
        }
        state.global_lsn = lsn + bytes.len() as Lsn;
        state.buffer_start = state.global_lsn - state.buffer.len() as Lsn;
        state.last_lsn.insert(txn_id, lsn);
        write_log_header(&self.disk, state.global_lsn, state.persist_lsn)?;
        Ok(lsn)
    }

    /// Persists the buffered records and advances the flushed-to-disk
    /// LSN. The WAL rule hangs off this: dirty pages are only written
    /// after the log covering them has been flushed.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut LogState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        self.disk.write_log(&state.buffer, state.buffer_start)?;
        state.buffer_start += state.buffer.len() as Lsn;
        state.persist_lsn = state.buffer_start;
        state.buffer.clear();
        write_log_header(&self.disk, state.global_lsn, state.persist_lsn)?;
        Ok(())
    }

    pub fn global_lsn(&self) -> Lsn {
        self.state.lock().unwrap().global_lsn
    }

    pub fn persist_lsn(&self) -> Lsn {
        self.state.lock().unwrap().persist_lsn
    }

    pub fn last_lsn_of(&self, txn_id: TxnId) -> Option<Lsn> {
        self.state.lock().unwrap().last_lsn.get(&txn_id).copied()
    }

    /// Drops the prev-LSN chain of a finished transaction.
    pub fn forget_txn(&self, txn_id: TxnId) {
        self.state.lock().unwrap().last_lsn.remove(&txn_id);
    }
}

fn write_log_header(disk: &Arc<DiskManager>, global_lsn: Lsn, persist_lsn: Lsn) -> Result<()> {
    let header = LogRecord {
        lsn: 0,
        txn_id: INVALID_TXN,
        prev_lsn: INVALID_LSN,
        payload: LogPayload::Header {
            global_lsn,
            persist_lsn,
            buffer_size: LOG_BUFFER_SIZE as u64,
        },
    };
    disk.write_log(&header.encode(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn round_trip(payload: LogPayload) {
        let record = LogRecord {
            lsn: 1234,
            txn_id: 7,
            prev_lsn: 99,
            payload,
        };
        let bytes = record.encode();
        assert_eq!(bytes.len(), record.total_len());
        let decoded = LogRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_every_record_kind_round_trips() {
        round_trip(LogPayload::Begin);
        round_trip(LogPayload::Commit);
        round_trip(LogPayload::Abort);
        round_trip(LogPayload::Checkpoint);
        round_trip(LogPayload::Insert {
            table: "emp".into(),
            rid: Rid::new(3, 5),
            record: vec![1, 2, 3, 4],
        });
        round_trip(LogPayload::Delete {
            table: "emp".into(),
            rid: Rid::new(1, 0),
            record: vec![9; 32],
        });
        round_trip(LogPayload::Update {
            table: "emp".into(),
            rid: Rid::new(2, 7),
            old: vec![1; 8],
            new: vec![2; 8],
        });
        round_trip(LogPayload::Header {
            global_lsn: 4096,
            persist_lsn: 2048,
            buffer_size: LOG_BUFFER_SIZE as u64,
        });
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let record = LogRecord {
            lsn: 0,
            txn_id: 1,
            prev_lsn: INVALID_LSN,
            payload: LogPayload::Insert {
                table: "t".into(),
                rid: Rid::new(1, 1),
                record: vec![5; 16],
            },
        };
        let bytes = record.encode();
        assert!(LogRecord::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(LogRecord::decode(&bytes[..10]).is_err());
    }

    #[test]
    fn test_lsn_is_byte_offset() {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path()).unwrap());
        let wal = LogManager::open(disk.clone()).unwrap();

        let lsn1 = wal.append(1, LogPayload::Begin).unwrap();
        assert_eq!(lsn1, HEADER_RECORD_SIZE as Lsn);
        let lsn2 = wal
            .append(
                1,
                LogPayload::Insert {
                    table: "t".into(),
                    rid: Rid::new(1, 0),
                    record: vec![0; 8],
                },
            )
            .unwrap();
        assert_eq!(lsn2, lsn1 + RECORD_HEADER_SIZE as Lsn);
        wal.flush().unwrap();

        // The record bytes at offset lsn2 decode to that very record.
        let mut buf = vec![0u8; 256];
        let n = disk.read_log(&mut buf, lsn2).unwrap();
        let record = LogRecord::decode(&buf[..n]).unwrap();
        assert_eq!(record.lsn, lsn2);
        assert_eq!(record.prev_lsn, lsn1);
        assert_eq!(record.txn_id, 1);
    }

    #[test]
    fn test_global_lsn_reloaded_on_reopen() {
        let dir = tempdir().unwrap();
        let end;
        {
            let disk = Arc::new(DiskManager::open(dir.path()).unwrap());
            let wal = LogManager::open(disk).unwrap();
            wal.append(1, LogPayload::Begin).unwrap();
            wal.append(1, LogPayload::Commit).unwrap();
            wal.flush().unwrap();
            end = wal.global_lsn();
        }
        let disk = Arc::new(DiskManager::open(dir.path()).unwrap());
        let wal = LogManager::open(disk).unwrap();
        assert_eq!(wal.global_lsn(), end);
        assert_eq!(wal.persist_lsn(), end);
    }

    #[test]
    fn test_prev_lsn_chains_per_transaction() {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path()).unwrap());
        let wal = LogManager::open(disk.clone()).unwrap();

        let a1 = wal.append(1, LogPayload::Begin).unwrap();
        let b1 = wal.append(2, LogPayload::Begin).unwrap();
        let a2 = wal.append(1, LogPayload::Commit).unwrap();
        wal.flush().unwrap();

        let mut buf = vec![0u8; 256];
        let n = wal.disk.read_log(&mut buf, a2).unwrap();
        let record = LogRecord::decode(&buf[..n]).unwrap();
        assert_eq!(record.prev_lsn, a1);
        assert_ne!(record.prev_lsn, b1);
    }
}
