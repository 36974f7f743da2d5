//! The engine aggregate: one `Engine` owns the disk manager, buffer
//! pool, log, lock and transaction managers plus the registry of open
//! tables and indexes. Recovery runs inside `Engine::open`, before any
//! transaction is accepted. The transactional operations here are the
//! substrate a SQL executor would sit on: they take table-level locks,
//! keep every index in step with its table, append the write-set entry
//! and emit the log record for each mutation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use log::info;

use crate::btree::{ColType, Index, KeySchema, Value};
use crate::buffer_pool::BufferPool;
use crate::disk::DiskManager;
use crate::error::{EngineError, Result};
use crate::lock::LockManager;
use crate::page::Rid;
use crate::recovery::RecoveryManager;
use crate::table::TableFile;
use crate::transaction::{Transaction, TransactionManager, WriteRecord, WriteType};
use crate::wal::{LogManager, LogPayload};

/// One indexed column: its type, byte length and offset inside the
/// fixed-size record.
#[derive(Debug, Clone)]
pub struct IndexCol {
    pub col_type: ColType,
    pub len: u32,
    pub offset: u32,
}

/// Definition of a secondary index over one table. The catalog proper is
/// an external collaborator; it hands this in when creating or reopening
/// an index.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub cols: Vec<IndexCol>,
    /// B+tree order override; `None` derives it from the page capacity.
    pub order: Option<usize>,
}

impl IndexDef {
    pub fn schema(&self) -> Result<KeySchema> {
        KeySchema::new(self.cols.iter().map(|c| (c.col_type, c.len)).collect())
    }
}

/// An open index together with its definition.
pub struct IndexEntry {
    pub def: IndexDef,
    pub index: Index,
}

impl IndexEntry {
    /// Extracts this index's key from a record image.
    pub fn key_of(&self, record: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.index.schema().total_len());
        for col in &self.def.cols {
            let start = col.offset as usize;
            key.extend_from_slice(&record[start..start + col.len as usize]);
        }
        key
    }
}

/// Name-keyed registry of open tables and their indexes. Abort and
/// recovery resolve table names through this.
pub struct Registry {
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    tables: RwLock<HashMap<String, Arc<TableFile>>>,
    indexes: RwLock<HashMap<String, Vec<Arc<IndexEntry>>>>,
}

fn table_file_name(table: &str) -> String {
    format!("{table}.tbl")
}

fn index_file_name(table: &str, index: &str) -> String {
    format!("{table}.{index}.idx")
}

impl Registry {
    pub fn new(disk: Arc<DiskManager>, pool: Arc<BufferPool>) -> Self {
        Self {
            disk,
            pool,
            tables: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves a table by name, opening its file on first use.
    pub fn open_table(&self, name: &str) -> Result<Arc<TableFile>> {
        if let Some(table) = self.tables.read().unwrap().get(name) {
            return Ok(table.clone());
        }
        let file_name = table_file_name(name);
        if !self.disk.file_exists(&file_name) {
            return Err(EngineError::TableNotFound(name.to_string()));
        }
        let table = Arc::new(TableFile::open(
            self.disk.clone(),
            self.pool.clone(),
            name,
            &file_name,
        )?);
        let mut tables = self.tables.write().unwrap();
        Ok(tables.entry(name.to_string()).or_insert(table).clone())
    }

    pub fn remove_table(&self, name: &str) -> Option<Arc<TableFile>> {
        self.indexes.write().unwrap().remove(name);
        self.tables.write().unwrap().remove(name)
    }

    pub fn indexes_of(&self, table: &str) -> Vec<Arc<IndexEntry>> {
        self.indexes
            .read()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn find_index(&self, table: &str, index_name: &str) -> Result<Arc<IndexEntry>> {
        self.indexes_of(table)
            .into_iter()
            .find(|e| e.def.name == index_name)
            .ok_or_else(|| EngineError::IndexNotFound(index_name.to_string()))
    }

    pub fn add_index(&self, table: &str, entry: Arc<IndexEntry>) -> Result<()> {
        let mut indexes = self.indexes.write().unwrap();
        let list = indexes.entry(table.to_string()).or_default();
        if list.iter().any(|e| e.def.name == entry.def.name) {
            return Err(EngineError::IndexExists(entry.def.name.clone()));
        }
        list.push(entry);
        Ok(())
    }

    pub fn remove_index(&self, table: &str, index_name: &str) -> Result<Arc<IndexEntry>> {
        let mut indexes = self.indexes.write().unwrap();
        let list = indexes
            .get_mut(table)
            .ok_or_else(|| EngineError::IndexNotFound(index_name.to_string()))?;
        let pos = list
            .iter()
            .position(|e| e.def.name == index_name)
            .ok_or_else(|| EngineError::IndexNotFound(index_name.to_string()))?;
        Ok(list.remove(pos))
    }

    /// Writes every open file's header and dirty pages back.
    pub fn flush_all(&self) -> Result<()> {
        for table in self.tables.read().unwrap().values() {
            table.flush()?;
        }
        for entries in self.indexes.read().unwrap().values() {
            for entry in entries {
                entry.index.flush()?;
            }
        }
        Ok(())
    }

    /// Fsyncs every open file; checkpoint durability.
    pub fn sync_all(&self) -> Result<()> {
        for table in self.tables.read().unwrap().values() {
            self.disk.sync_file(table.fd())?;
        }
        for entries in self.indexes.read().unwrap().values() {
            for entry in entries {
                self.disk.sync_file(entry.index.fd())?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub buffer_pool_frames: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            buffer_pool_frames: 256,
        }
    }
}

pub struct Engine {
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    log: Arc<LogManager>,
    locks: Arc<LockManager>,
    txns: Arc<TransactionManager>,
    registry: Arc<Registry>,
}

impl Engine {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open_with(dir, EngineOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(dir: P, options: EngineOptions) -> Result<Self> {
        let disk = Arc::new(DiskManager::open(dir)?);
        let pool = Arc::new(BufferPool::new(disk.clone(), options.buffer_pool_frames));
        let log = Arc::new(LogManager::open(disk.clone())?);
        let registry = Arc::new(Registry::new(disk.clone(), pool.clone()));

        let summary =
            RecoveryManager::new(disk.clone(), log.clone(), registry.clone()).run()?;
        info!(
            "engine open at {}: recovery redid {}, undid {}, aborted {:?}",
            disk.dir().display(),
            summary.redone,
            summary.undone,
            summary.aborted_txns
        );

        let locks = Arc::new(LockManager::new());
        let txns = Arc::new(TransactionManager::new(
            summary.next_txn_id,
            disk.clone(),
            pool.clone(),
            log.clone(),
            locks.clone(),
            registry.clone(),
        ));
        Ok(Self {
            disk,
            pool,
            log,
            locks,
            txns,
            registry,
        })
    }

    pub fn begin(&self) -> Result<Arc<Transaction>> {
        self.txns.begin()
    }

    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        self.txns.commit(txn)
    }

    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<()> {
        self.txns.abort(txn)
    }

    /// Static checkpoint: quiesces the engine, persists everything and
    /// records the checkpoint LSN in the start file.
    pub fn checkpoint(&self) -> Result<()> {
        self.txns.checkpoint(None)
    }

    /// Clean shutdown is a checkpoint followed by drop.
    pub fn shutdown(self) -> Result<()> {
        self.txns.checkpoint(None)
    }

    /// Drops the engine without flushing anything, as a crash would.
    /// Committed work survives through the log; everything else is lost.
    pub fn simulate_crash(self) {}

    // --- DDL surface (driven by the out-of-scope catalog) ---

    pub fn create_table(&self, name: &str, record_size: usize) -> Result<()> {
        if self.disk.file_exists(&table_file_name(name)) {
            return Err(EngineError::TableExists(name.to_string()));
        }
        TableFile::create(&self.disk, &table_file_name(name), record_size)?;
        self.registry.open_table(name)?;
        Ok(())
    }

    pub fn open_table(&self, name: &str) -> Result<Arc<TableFile>> {
        self.registry.open_table(name)
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        let table = self.registry.open_table(name)?;
        for entry in self.registry.indexes_of(name) {
            self.drop_index(name, &entry.def.name)?;
        }
        self.pool.delete_all_pages(table.fd())?;
        self.registry.remove_table(name);
        self.disk.close_file(table.fd())?;
        self.disk.destroy_file(&table_file_name(name))
    }

    fn validate_index_cols(&self, table: &Arc<TableFile>, def: &IndexDef) -> Result<()> {
        for col in &def.cols {
            if (col.offset + col.len) as usize > table.record_size() {
                return Err(EngineError::ColumnNotFound(format!(
                    "{}..{} outside {}-byte records of {}",
                    col.offset,
                    col.offset + col.len,
                    table.record_size(),
                    table.name()
                )));
            }
        }
        Ok(())
    }

    /// Creates an index and backfills it from the table's current rows.
    pub fn create_index(&self, table_name: &str, def: IndexDef) -> Result<()> {
        let table = self.registry.open_table(table_name)?;
        self.validate_index_cols(&table, &def)?;
        let file_name = index_file_name(table_name, &def.name);
        if self.disk.file_exists(&file_name) {
            return Err(EngineError::IndexExists(def.name.clone()));
        }
        let schema = def.schema()?;
        Index::create(&self.disk, &file_name, &schema, def.order)?;
        let index = Index::open(self.disk.clone(), self.pool.clone(), &def.name, &file_name)?;
        let entry = Arc::new(IndexEntry { def, index });

        let mut scan = table.scan()?;
        while !scan.is_end() {
            let rid = scan.rid();
            if let Some(record) = table.get_record(rid)? {
                entry.index.insert_entry(&entry.key_of(&record), rid)?;
            }
            scan.next()?;
        }
        self.registry.add_index(table_name, entry)
    }

    /// Reopens an existing index file, checking it against the caller's
    /// definition.
    pub fn open_index(&self, table_name: &str, def: IndexDef) -> Result<()> {
        let table = self.registry.open_table(table_name)?;
        self.validate_index_cols(&table, &def)?;
        let file_name = index_file_name(table_name, &def.name);
        if !self.disk.file_exists(&file_name) {
            return Err(EngineError::IndexNotFound(def.name.clone()));
        }
        let index = Index::open(self.disk.clone(), self.pool.clone(), &def.name, &file_name)?;
        let declared = def.schema()?;
        if index.schema().cols() != declared.cols() {
            return Err(EngineError::IncompatibleType);
        }
        self.registry.add_index(table_name, Arc::new(IndexEntry { def, index }))
    }

    pub fn drop_index(&self, table_name: &str, index_name: &str) -> Result<()> {
        let entry = self.registry.remove_index(table_name, index_name)?;
        self.pool.delete_all_pages(entry.index.fd())?;
        self.disk.close_file(entry.index.fd())?;
        self.disk.destroy_file(&index_file_name(table_name, index_name))
    }

    /// Rebuilds one index from a fresh table scan. Index pages are not
    /// WAL-protected, so this is the reconciliation hook after a crash.
    pub fn rebuild_index(&self, table_name: &str, index_name: &str) -> Result<()> {
        let def = self.registry.find_index(table_name, index_name)?.def.clone();
        self.drop_index(table_name, index_name)?;
        self.create_index(table_name, def)
    }

    // --- transactional operations ---

    /// Inserts a record under a table-level X lock, updating every index
    /// and logging the effect. Recoverable failures abort the
    /// transaction and surface as `TxnAborted`.
    pub fn insert(&self, txn: &Arc<Transaction>, table: &str, record: &[u8]) -> Result<Rid> {
        self.insert_inner(txn, table, record)
            .map_err(|e| self.txns.catch(txn, e))
    }

    fn insert_inner(&self, txn: &Arc<Transaction>, table: &str, record: &[u8]) -> Result<Rid> {
        let table_file = self.registry.open_table(table)?;
        self.locks.lock_exclusive_on_table(txn, table_file.fd())?;
        let rid = table_file.insert_record(record)?;
        // Write-set first: if an index update or the log append fails
        // below, abort can still invert the row through the tolerant
        // record-store variants.
        txn.add_write(WriteRecord {
            wtype: WriteType::Insert,
            table: table.to_string(),
            rid,
            old: None,
            new: Some(record.to_vec()),
        });
        for entry in self.registry.indexes_of(table) {
            entry.index.insert_entry(&entry.key_of(record), rid)?;
        }
        self.log.append(
            txn.id(),
            LogPayload::Insert {
                table: table.to_string(),
                rid,
                record: record.to_vec(),
            },
        )?;
        Ok(rid)
    }

    pub fn get(&self, txn: &Arc<Transaction>, table: &str, rid: Rid) -> Result<Option<Vec<u8>>> {
        self.get_inner(txn, table, rid)
            .map_err(|e| self.txns.catch(txn, e))
    }

    fn get_inner(&self, txn: &Arc<Transaction>, table: &str, rid: Rid) -> Result<Option<Vec<u8>>> {
        let table_file = self.registry.open_table(table)?;
        self.locks.lock_shared_on_table(txn, table_file.fd())?;
        table_file.get_record(rid)
    }

    pub fn update(&self, txn: &Arc<Transaction>, table: &str, rid: Rid, new: &[u8]) -> Result<()> {
        self.update_inner(txn, table, rid, new)
            .map_err(|e| self.txns.catch(txn, e))
    }

    fn update_inner(
        &self,
        txn: &Arc<Transaction>,
        table: &str,
        rid: Rid,
        new: &[u8],
    ) -> Result<()> {
        let table_file = self.registry.open_table(table)?;
        self.locks.lock_exclusive_on_table(txn, table_file.fd())?;
        let old = table_file
            .get_record(rid)?
            .ok_or(EngineError::RecordNotFound(rid))?;
        txn.add_write(WriteRecord {
            wtype: WriteType::Update,
            table: table.to_string(),
            rid,
            old: Some(old.clone()),
            new: Some(new.to_vec()),
        });
        table_file.update_record(rid, new)?;
        for entry in self.registry.indexes_of(table) {
            let old_key = entry.key_of(&old);
            let new_key = entry.key_of(new);
            if old_key != new_key {
                entry.index.delete_entry(&old_key)?;
                entry.index.insert_entry(&new_key, rid)?;
            }
        }
        self.log.append(
            txn.id(),
            LogPayload::Update {
                table: table.to_string(),
                rid,
                old,
                new: new.to_vec(),
            },
        )?;
        Ok(())
    }

    pub fn delete(&self, txn: &Arc<Transaction>, table: &str, rid: Rid) -> Result<()> {
        self.delete_inner(txn, table, rid)
            .map_err(|e| self.txns.catch(txn, e))
    }

    fn delete_inner(&self, txn: &Arc<Transaction>, table: &str, rid: Rid) -> Result<()> {
        let table_file = self.registry.open_table(table)?;
        self.locks.lock_exclusive_on_table(txn, table_file.fd())?;
        let old = table_file
            .get_record(rid)?
            .ok_or(EngineError::RecordNotFound(rid))?;
        txn.add_write(WriteRecord {
            wtype: WriteType::Delete,
            table: table.to_string(),
            rid,
            old: Some(old.clone()),
            new: None,
        });
        table_file.delete_record(rid)?;
        for entry in self.registry.indexes_of(table) {
            entry.index.delete_entry(&entry.key_of(&old))?;
        }
        self.log.append(
            txn.id(),
            LogPayload::Delete {
                table: table.to_string(),
                rid,
                record: old,
            },
        )?;
        Ok(())
    }

    /// Full scan in page-then-slot order under a table-level S lock.
    pub fn scan_all(&self, txn: &Arc<Transaction>, table: &str) -> Result<Vec<(Rid, Vec<u8>)>> {
        self.scan_inner(txn, table)
            .map_err(|e| self.txns.catch(txn, e))
    }

    fn scan_inner(&self, txn: &Arc<Transaction>, table: &str) -> Result<Vec<(Rid, Vec<u8>)>> {
        let table_file = self.registry.open_table(table)?;
        self.locks.lock_shared_on_table(txn, table_file.fd())?;
        let mut rows = Vec::new();
        let mut scan = table_file.scan()?;
        while !scan.is_end() {
            let rid = scan.rid();
            if let Some(record) = table_file.get_record(rid)? {
                rows.push((rid, record));
            }
            scan.next()?;
        }
        Ok(rows)
    }

    /// Point probe through an index.
    pub fn index_lookup(
        &self,
        txn: &Arc<Transaction>,
        table: &str,
        index_name: &str,
        key: &[Value],
    ) -> Result<Vec<Rid>> {
        self.index_lookup_inner(txn, table, index_name, key)
            .map_err(|e| self.txns.catch(txn, e))
    }

    fn index_lookup_inner(
        &self,
        txn: &Arc<Transaction>,
        table: &str,
        index_name: &str,
        key: &[Value],
    ) -> Result<Vec<Rid>> {
        let table_file = self.registry.open_table(table)?;
        self.locks.lock_shared_on_table(txn, table_file.fd())?;
        let entry = self.registry.find_index(table, index_name)?;
        let key = entry.index.schema().encode_key(key)?;
        entry.index.get_value(&key)
    }

    /// Range scan `[lower, upper]` through an index, rids in key order.
    /// `None` bounds run to the first or last leaf.
    pub fn index_range(
        &self,
        txn: &Arc<Transaction>,
        table: &str,
        index_name: &str,
        lower: Option<&[Value]>,
        upper: Option<&[Value]>,
    ) -> Result<Vec<Rid>> {
        self.index_range_inner(txn, table, index_name, lower, upper)
            .map_err(|e| self.txns.catch(txn, e))
    }

    fn index_range_inner(
        &self,
        txn: &Arc<Transaction>,
        table: &str,
        index_name: &str,
        lower: Option<&[Value]>,
        upper: Option<&[Value]>,
    ) -> Result<Vec<Rid>> {
        let table_file = self.registry.open_table(table)?;
        self.locks.lock_shared_on_table(txn, table_file.fd())?;
        let entry = self.registry.find_index(table, index_name)?;
        let schema = entry.index.schema();
        let lower = lower.map(|vals| schema.encode_key(vals)).transpose()?;
        let upper = upper.map(|vals| schema.encode_key(vals)).transpose()?;

        let mut rids = Vec::new();
        let mut scan = entry
            .index
            .range_scan(lower.as_deref(), upper.as_deref())?;
        while !scan.is_end() {
            rids.push(scan.rid()?);
            scan.next()?;
        }
        Ok(rids)
    }
}
