//! # Granite Lock
//!
//! Transactional lock manager for GraniteDB's row-level storage engine:
//! - Row-level locks kept as one bitmap per (transaction, page) pair
//! - Table-level intention locks (IS, IX, S, X, AUTO_INC)
//! - Gap, next-key, and insert-intention modes for phantom prevention
//! - FIFO wait queues with condition-variable suspension and timeouts
//! - Online deadlock detection (Brent's cycle-finding) with victim selection
//! - Lock inheritance across B-tree page splits, merges, and discards
//!
//! Locks live only in memory. The B-tree, buffer pool, MVCC, and SQL layers
//! are collaborators reached through narrow interfaces: page geometry comes
//! in as [`PageView`] snapshots, implicit-lock holders through [`MvccReader`],
//! and cluster priority decisions through [`PriorityPolicy`].

pub mod btree;
pub mod deadlock;
pub mod implicit;
pub mod lock;
pub mod mode;
pub mod page;
pub mod policy;
pub mod predicate;
pub mod queue;
pub mod report;
pub mod sys;
pub mod table;
pub mod trx;
pub mod validate;
pub mod wait;

pub use implicit::{MvccReader, NoImplicitLocks};
pub use lock::{LockMode, TypeMode};
pub use mode::GapMode;
pub use page::PageView;
pub use policy::{FifoPolicy, NullWaitObserver, PriorityPolicy, WaitObserver};
pub use predicate::Mbr;
pub use sys::LockSys;
pub use trx::{Trx, TrxSet, TrxState};

/// Outcome of a lock request or a completed lock wait.
///
/// The SQL layer drives its retry/rollback state machine on these values,
/// so they are a status enum rather than an error type. `SuccessLockedRec`
/// is `Success` plus the information that a new explicit lock record was
/// created; most callers collapse the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// The request was granted (or subsumed by an existing lock).
    Success,
    /// The request was granted and a new explicit lock record was created.
    SuccessLockedRec,
    /// The request was enqueued; the caller must block in [`LockSys::wait`].
    Wait,
    /// The wait deadline elapsed and the waiter cancelled itself.
    WaitTimeout,
    /// This transaction was chosen as a deadlock victim; roll it back.
    Deadlock,
    /// The connection was killed while waiting.
    Interrupted,
}

impl LockStatus {
    /// Fold `SuccessLockedRec` into `Success`.
    pub fn collapse_locked_rec(self) -> Self {
        match self {
            LockStatus::SuccessLockedRec => LockStatus::Success,
            other => other,
        }
    }

    /// Whether the request was granted.
    pub fn is_success(self) -> bool {
        matches!(self, LockStatus::Success | LockStatus::SuccessLockedRec)
    }
}
