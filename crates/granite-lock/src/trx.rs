//! Transaction objects as seen by the lock manager, and the registry of
//! active transactions.

use crate::lock::LockId;
use crate::LockStatus;
use dashmap::DashMap;
use granite_common::prelude::*;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxState {
    Active,
    Prepared,
    /// Committed in memory; the transaction object still exists but can no
    /// longer block anyone or receive locks.
    Committed,
}

/// Wait state of a transaction. All fields are guarded by the per-trx
/// mutex; the transitions that remove waits-for edges (grant, cancel)
/// additionally hold the global wait mutex.
pub(crate) struct TrxWait {
    pub state: TrxState,
    /// The one lock this transaction currently waits for.
    pub wait_lock: Option<LockId>,
    /// Whether `wait_lock` is a table lock; kept here so the wait loop
    /// does not need the lock-system latch.
    pub wait_is_table: bool,
    /// The transaction whose lock is currently blocking `wait_lock`.
    pub wait_trx: Option<Arc<Trx>>,
    /// Set when the deadlock detector picks this transaction for rollback.
    pub victim: bool,
    /// Error slot read by the waiter when it resumes.
    pub error: LockStatus,
    pub suspend_time: Option<Instant>,
}

pub struct Trx {
    pub id: TrxId,
    pub isolation: IsolationLevel,
    pub(crate) wait: Mutex<TrxWait>,
    /// Slept on under the global wait mutex while `wait_lock` is set.
    pub(crate) cond: Condvar,
    undo_entries: AtomicU64,
    dirtied_nontrans: AtomicBool,
    interrupted: AtomicBool,
}

impl Trx {
    fn new(id: TrxId, isolation: IsolationLevel) -> Arc<Trx> {
        Arc::new(Trx {
            id,
            isolation,
            wait: Mutex::new(TrxWait {
                state: TrxState::Active,
                wait_lock: None,
                wait_is_table: false,
                wait_trx: None,
                victim: false,
                error: LockStatus::Success,
                suspend_time: None,
            }),
            cond: Condvar::new(),
            undo_entries: AtomicU64::new(0),
            dirtied_nontrans: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(id: TrxId) -> Arc<Trx> {
        Trx::new(id, IsolationLevel::RepeatableRead)
    }

    pub fn state(&self) -> TrxState {
        self.wait.lock().state
    }

    pub fn set_state(&self, state: TrxState) {
        self.wait.lock().state = state;
    }

    /// Whether this transaction is currently enqueued behind another.
    pub fn is_waiting(&self) -> bool {
        self.wait.lock().wait_lock.is_some()
    }

    /// The transaction currently blocking this one, if any.
    pub fn blocking_trx(&self) -> Option<Arc<Trx>> {
        self.wait.lock().wait_trx.clone()
    }

    pub fn was_chosen_as_victim(&self) -> bool {
        self.wait.lock().victim
    }

    /// Undo log entries written so far; one input to the deadlock victim
    /// weight.
    pub fn undo_entries(&self) -> u64 {
        self.undo_entries.load(Ordering::Relaxed)
    }

    pub fn add_undo_entries(&self, n: u64) {
        self.undo_entries.fetch_add(n, Ordering::Relaxed);
    }

    /// Note that this transaction modified a non-transactional table.
    /// Such transactions get the highest victim weight so they are
    /// avoided in deadlock resolution.
    pub fn note_nontrans_update(&self) {
        self.dirtied_nontrans.store(true, Ordering::Relaxed);
    }

    pub fn has_nontrans_updates(&self) -> bool {
        self.dirtied_nontrans.load(Ordering::Relaxed)
    }

    /// Mark the connection as killed and nudge the waiter. Deliver kills
    /// through [`crate::LockSys::interrupt`], which holds the wait mutex
    /// so the wake-up cannot race the waiter going to sleep.
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Trx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trx")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .finish()
    }
}

/// Registry of live transactions. Transaction IDs are monotonic; the
/// registry also serves lookups for the implicit-lock bridge and bounds
/// the deadlock detector's iteration count.
pub struct TrxSet {
    active: DashMap<TrxId, Arc<Trx>>,
    next_id: AtomicU64,
}

impl TrxSet {
    pub fn new() -> TrxSet {
        TrxSet {
            active: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start a new transaction and register it.
    pub fn begin(&self, isolation: IsolationLevel) -> Arc<Trx> {
        let id = TrxId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let trx = Trx::new(id, isolation);
        self.active.insert(id, trx.clone());
        trx
    }

    pub fn find(&self, id: TrxId) -> Option<Arc<Trx>> {
        self.active.get(&id).map(|e| e.value().clone())
    }

    /// Forget a transaction once its locks are released.
    pub fn deregister(&self, id: TrxId) {
        self.active.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Smallest id that has never been handed out. A record claiming a
    /// modifier id at or above this is corrupted.
    pub fn max_trx_id(&self) -> TrxId {
        TrxId(self.next_id.load(Ordering::SeqCst))
    }

    /// Smallest id among live transactions, if any are registered.
    pub fn min_active_id(&self) -> Option<TrxId> {
        self.active.iter().map(|e| *e.key()).min()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Trx>)) {
        for entry in self.active.iter() {
            f(entry.value());
        }
    }
}

impl Default for TrxSet {
    fn default() -> Self {
        Self::new()
    }
}
