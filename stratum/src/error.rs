use thiserror::Error;

use crate::page::Rid;
use crate::TxnId;

/// Every failure the engine can surface. Low-level modules return the
/// specific variant; the transaction manager is the one place where
/// recoverable variants are converted into [`EngineError::TxnAborted`]
/// after rolling the transaction back.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("page {page_no} does not exist in {file}")]
    PageNotExist { file: String, page_no: i32 },

    #[error("buffer pool exhausted: every frame is pinned")]
    NoFreeFrame,

    #[error("string of {len} bytes exceeds column length {max}")]
    StringOverflow { len: usize, max: usize },

    #[error("incompatible column types in comparison")]
    IncompatibleType,

    #[error("record {0} not found")]
    RecordNotFound(Rid),

    #[error("index entry not found")]
    IndexEntryNotFound,

    #[error("duplicate key")]
    DuplicateKey,

    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("column {0} not found")]
    ColumnNotFound(String),

    #[error("ambiguous column {0}")]
    AmbiguousColumn(String),

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("index {0} already exists")]
    IndexExists(String),

    #[error("index {0} not found")]
    IndexNotFound(String),

    #[error("transaction {0} wounded for deadlock prevention")]
    DeadlockPrevention(TxnId),

    #[error("transaction {0} requested a lock in its shrinking phase")]
    LockOnShrinking(TxnId),

    #[error("transaction {0} lost an upgrade race")]
    UpgradeConflict(TxnId),

    #[error("transaction {txn_id} aborted: {reason}")]
    TxnAborted { txn_id: TxnId, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the transaction manager should respond by aborting the
    /// transaction rather than surfacing the error as-is.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::DeadlockPrevention(_)
                | EngineError::LockOnShrinking(_)
                | EngineError::UpgradeConflict(_)
                | EngineError::NoFreeFrame
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
