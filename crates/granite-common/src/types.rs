//! Core types for GraniteDB

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId(pub u64);

/// Unique identifier for an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexId(pub u64);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrxId(pub u64);

/// Identifier of a B-tree leaf page: tablespace plus page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId {
    pub space: u32,
    pub page_no: u32,
}

impl TrxId {
    pub const INVALID: TrxId = TrxId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trx:{}", self.0)
    }
}

impl PageId {
    pub fn new(space: u32, page_no: u32) -> Self {
        Self { space, page_no }
    }

    /// Integer hash of the page identifier, used to select a hash bucket.
    pub fn fold(&self) -> u64 {
        ((self.space as u64) << 20) + self.space as u64 + self.page_no as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.space, self.page_no)
    }
}

// ============================================================================
// Record heap numbers
// ============================================================================

/// Heap number of a record within a page. The infimum and supremum
/// sentinel records occupy the two lowest slots; user records start at 2.
pub type HeapNo = usize;

/// Heap number of the page infimum sentinel record.
pub const HEAP_NO_INFIMUM: HeapNo = 0;
/// Heap number of the page supremum sentinel record.
pub const HEAP_NO_SUPREMUM: HeapNo = 1;
/// Lowest heap number a user record can have.
pub const HEAP_NO_USER_LOW: HeapNo = 2;

// ============================================================================
// Transactions
// ============================================================================

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::RepeatableRead
    }
}
