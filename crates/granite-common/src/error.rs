//! Error types for GraniteDB

use thiserror::Error;

/// Result type alias using GraniteDB's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for GraniteDB
#[derive(Error, Debug)]
pub enum Error {
    // Transaction errors
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    // Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction not found: {0}")]
    NotFound(u64),

    #[error("Deadlock detected")]
    Deadlock,

    #[error("Lock wait timeout")]
    LockTimeout,

    #[error("Lock wait interrupted")]
    Interrupted,

    #[error("Transaction already committed: {0}")]
    AlreadyCommitted(u64),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page not found: {0}")]
    PageNotFound(u64),

    #[error("Page corrupted: {0}")]
    PageCorrupted(u64),

    #[error("Index error: {0}")]
    IndexError(String),
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}
