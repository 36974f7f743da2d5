//! # Stratum Storage Engine
//! The transactional storage substrate beneath a SQL front-end.
//! This crate owns the on-disk and in-memory representation of data:
//! slotted record pages, B+tree secondary indexes, a pinned buffer pool,
//! a write-ahead log with analyze/redo/undo recovery, and a
//! multi-granularity lock manager with wound-wait deadlock prevention.

/// Slot-occupancy bitmaps for record pages.
pub mod bitmap;
/// The B+tree index implementation.
pub mod btree;
/// The buffer pool manager.
pub mod buffer_pool;
/// File-level I/O: data files, index files, the log and the start file.
pub mod disk;
/// The engine aggregate wiring every manager together.
pub mod engine;
/// The engine-wide error taxonomy.
pub mod error;
/// Fault injection points for crash and I/O-failure tests.
pub mod failpoint;
/// The lock manager for concurrency control.
pub mod lock;
/// The page layout and identifiers.
pub mod page;
/// Crash recovery: analyze, redo, undo.
pub mod recovery;
/// The slotted-page record store.
pub mod table;
/// The transaction manager.
pub mod transaction;
/// The Write-Ahead Log manager.
pub mod wal;

/// The size of a single page in bytes. Page 0 of every file is its header.
pub const PAGE_SIZE: usize = 4096;

/// A page number within one file. The first page is page 0.
pub type PageNo = i32;

/// Sentinel page number: "no such page".
pub const NO_PAGE: PageNo = -1;

/// A Log Sequence Number; doubles as a byte offset into the log file.
pub type Lsn = u64;

/// Sentinel LSN for records without a predecessor.
pub const INVALID_LSN: Lsn = u64::MAX;

/// A transaction identifier; also the wound-wait priority key.
pub type TxnId = u64;

/// Sentinel transaction id for log records outside any transaction.
pub const INVALID_TXN: TxnId = u64::MAX;

pub use buffer_pool::{BufferPool, PageGuard};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use page::{PageId, Rid};
