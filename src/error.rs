use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for arbordb operations
pub type Result<T> = result::Result<T, Error>;

/// Errors surfaced by the storage engine
#[derive(Debug, Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("no matching key/data pair found")]
    NotFound,
    /// Key is out of order for an append-mode put
    #[error("key is out of order for an append-mode put")]
    KeyMismatch,
    /// Requested page not found
    #[error("requested page {0} not found")]
    PageNotFound(u64),
    /// Database file is corrupted
    #[error("database file is corrupted: {details}")]
    Corrupted { details: String },
    /// Database version mismatch
    #[error("database version mismatch")]
    VersionMismatch,
    /// File is not a valid arbordb file
    #[error("file is not a valid arbordb file")]
    Invalid,
    /// Environment mapsize limit reached
    #[error("environment mapsize limit reached")]
    MapFull,
    /// Environment maxdbs limit reached
    #[error("environment maxdbs limit reached")]
    DbsFull,
    /// Environment maxreaders limit reached
    #[error("environment maxreaders limit reached")]
    ReadersFull,
    /// Another write transaction is already active
    #[error("another write transaction is already active")]
    WriterBusy,
    /// Operation not allowed in a read-only transaction
    #[error("operation not allowed in a read-only transaction")]
    TxnReadOnly,
    /// Transaction is no longer active
    #[error("transaction is no longer active")]
    TxnInvalid,
    /// Transaction has an active child transaction
    #[error("transaction has an active child transaction")]
    TxnHasChild,
    /// Cursor is closed or has no position
    #[error("cursor is closed or has no position")]
    CursorInvalid,
    /// Operation and database are incompatible
    #[error("operation and database are incompatible")]
    Incompatible,
    /// Invalid database handle
    #[error("invalid database handle")]
    BadDbi,
    /// Unsupported size of key or value
    #[error("unsupported size of key or value")]
    BadValSize,
    /// Environment is read-only
    #[error("environment is read-only")]
    EnvReadOnly,
    /// I/O error from the underlying file or map
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn corrupted(details: impl Into<String>) -> Error {
        Error::Corrupted { details: details.into() }
    }
}
