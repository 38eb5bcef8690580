//! The lock system: global latch, hash tables, and the lock heap.
//!
//! Mutex hierarchy, top to bottom:
//! 1. `latch` protects every structure in [`LockHeap`]: the arena, the
//!    three hash tables, table queues, and per-transaction lock lists.
//! 2. `wait_mutex` is the condition-variable domain for waiters and
//!    serializes the transitions that remove waits-for edges (grant,
//!    cancel). Acquired inside `latch` when both are held.
//! 3. The per-transaction mutex guards each transaction's wait fields and
//!    state, ordered after both.
//!
//! The deadlock detector acquires `wait_mutex` first and, for reporting,
//! releases it and reacquires both in standard order.

use crate::lock::{LockArena, LockId, TypeMode};
use crate::policy::{FifoPolicy, NullWaitObserver, PriorityPolicy, WaitObserver};
use crate::trx::TrxSet;
use granite_common::metrics::LockMetrics;
use granite_common::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Which of the three hash tables a lock lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HashKind {
    Rec,
    Prdt,
    PrdtPage,
}

impl HashKind {
    pub fn of(type_mode: TypeMode) -> HashKind {
        if type_mode.is_predicate() {
            HashKind::Prdt
        } else if type_mode.is_predicate_page() {
            HashKind::PrdtPage
        } else {
            HashKind::Rec
        }
    }
}

/// Open hash table of record locks keyed by the page-id fold. Each cell
/// holds the locks of every page hashing to it, in insertion order; chain
/// order within one page is queue order.
pub(crate) struct LockHash {
    cells: Vec<Vec<LockId>>,
}

impl LockHash {
    pub fn new(n_cells: usize) -> LockHash {
        LockHash {
            cells: vec![Vec::new(); n_cells.max(1)],
        }
    }

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    fn cell_index(&self, id: PageId) -> usize {
        (id.fold() % self.cells.len() as u64) as usize
    }

    pub fn cell(&self, id: PageId) -> &[LockId] {
        &self.cells[self.cell_index(id)]
    }

    pub fn append(&mut self, id: PageId, lock: LockId) {
        let cell = self.cell_index(id);
        self.cells[cell].push(lock);
    }

    /// Splice `lock` into the chain right after `after`. Used when a
    /// priority waiter jumps the queue.
    pub fn insert_after(&mut self, id: PageId, after: LockId, lock: LockId) {
        let cell = self.cell_index(id);
        match self.cells[cell].iter().position(|&l| l == after) {
            Some(pos) => self.cells[cell].insert(pos + 1, lock),
            None => self.cells[cell].push(lock),
        }
    }

    pub fn remove(&mut self, id: PageId, lock: LockId) {
        let cell = self.cell_index(id);
        self.cells[cell].retain(|&l| l != lock);
    }

    fn rebuild(&mut self, n_cells: usize, page_of: impl Fn(LockId) -> PageId) {
        let old = std::mem::replace(&mut self.cells, vec![Vec::new(); n_cells.max(1)]);
        for lock in old.into_iter().flatten() {
            let id = page_of(lock);
            let cell = self.cell_index(id);
            self.cells[cell].push(lock);
        }
    }

    pub fn total_locks(&self) -> usize {
        self.cells.iter().map(|c| c.len()).sum()
    }
}

/// Per-table lock queue and bookkeeping.
#[derive(Default)]
pub(crate) struct TableQueue {
    /// Table locks in queue order.
    pub locks: Vec<LockId>,
    /// Transaction currently holding the granted AUTO_INC lock.
    pub autoinc_trx: Option<TrxId>,
    pub n_waiting_or_granted_autoinc: u32,
    /// Granted or waiting S/X table locks. When zero, an IS/IX request
    /// can skip the queue scan entirely.
    pub n_lock_x_or_s: u32,
    /// Record locks on this table's pages.
    pub n_rec_locks: u64,
}

/// Per-transaction lock bookkeeping, owned by the lock heap.
#[derive(Default)]
pub(crate) struct TrxOwned {
    /// Every lock the transaction holds or waits for, oldest first.
    pub locks: Vec<LockId>,
    /// Flat vector of table locks for O(1) reverse traversal; removed
    /// entries become `None`.
    pub table_locks: Vec<Option<LockId>>,
    /// Granted AUTO_INC locks in acquisition order; released in reverse.
    /// Entries freed out of order become `None`.
    pub autoinc_locks: Vec<Option<LockId>>,
}

impl TrxOwned {
    pub fn holds_autoinc(&self) -> bool {
        self.autoinc_locks.iter().any(|l| l.is_some())
    }
}

/// Everything guarded by the global lock-system latch.
pub(crate) struct LockHeap {
    pub arena: LockArena,
    pub rec_hash: LockHash,
    pub prdt_hash: LockHash,
    pub prdt_page_hash: LockHash,
    pub tables: HashMap<TableId, TableQueue>,
    pub trx_owned: HashMap<TrxId, TrxOwned>,
}

impl LockHeap {
    fn new(n_cells: usize) -> LockHeap {
        LockHeap {
            arena: LockArena::new(),
            rec_hash: LockHash::new(n_cells),
            prdt_hash: LockHash::new(n_cells),
            prdt_page_hash: LockHash::new(n_cells),
            tables: HashMap::new(),
            trx_owned: HashMap::new(),
        }
    }

    pub fn hash(&self, kind: HashKind) -> &LockHash {
        match kind {
            HashKind::Rec => &self.rec_hash,
            HashKind::Prdt => &self.prdt_hash,
            HashKind::PrdtPage => &self.prdt_page_hash,
        }
    }

    pub fn hash_mut(&mut self, kind: HashKind) -> &mut LockHash {
        match kind {
            HashKind::Rec => &mut self.rec_hash,
            HashKind::Prdt => &mut self.prdt_hash,
            HashKind::PrdtPage => &mut self.prdt_page_hash,
        }
    }

    /// All locks on `id`, in chain (queue) order. Snapshot, so callers may
    /// mutate the heap while walking it.
    pub fn page_chain(&self, kind: HashKind, id: PageId) -> Vec<LockId> {
        self.hash(kind)
            .cell(id)
            .iter()
            .copied()
            .filter(|&l| self.arena.get(l).rec().page_id == id)
            .collect()
    }

    pub fn first_lock_on_page(&self, kind: HashKind, id: PageId) -> Option<LockId> {
        self.hash(kind)
            .cell(id)
            .iter()
            .copied()
            .find(|&l| self.arena.get(l).rec().page_id == id)
    }

    /// All locks with a bit set on (`id`, `heap_no`), in queue order.
    pub fn locks_on_rec(&self, kind: HashKind, id: PageId, heap_no: HeapNo) -> Vec<LockId> {
        self.hash(kind)
            .cell(id)
            .iter()
            .copied()
            .filter(|&l| {
                let lock = self.arena.get(l);
                let rec = lock.rec();
                rec.page_id == id && rec.bitmap.get(heap_no)
            })
            .collect()
    }

    pub fn trx_owned_mut(&mut self, trx: TrxId) -> &mut TrxOwned {
        self.trx_owned.entry(trx).or_default()
    }

    pub fn trx_owned(&self, trx: TrxId) -> Option<&TrxOwned> {
        self.trx_owned.get(&trx)
    }

    pub fn table_queue_mut(&mut self, table: TableId) -> &mut TableQueue {
        self.tables.entry(table).or_default()
    }

    pub fn table_queue(&self, table: TableId) -> Option<&TableQueue> {
        self.tables.get(&table)
    }
}

/// The lock system. One per storage engine instance.
pub struct LockSys {
    pub(crate) latch: Mutex<LockHeap>,
    /// Condition-variable domain for waiters; see the module docs for the
    /// acquisition order.
    pub(crate) wait_mutex: Mutex<()>,
    pub metrics: LockMetrics,
    pub(crate) trxs: TrxSet,
    pub(crate) policy: Arc<dyn PriorityPolicy>,
    pub(crate) observer: Arc<dyn WaitObserver>,
    wait_timeout_us: AtomicU64,
    deadlock_detect: AtomicBool,
    deadlock_report: Mutex<DeadlockReport>,
    /// Text of the most recently detected deadlock, for diagnostics.
    pub(crate) latest_deadlock: Mutex<String>,
}

impl LockSys {
    /// Create the lock system at engine start.
    pub fn create(config: LockConfig) -> LockSys {
        if let Err(errors) = config.validate() {
            warn!(?errors, "lock config validation failed, using values as-is");
        }
        LockSys {
            latch: Mutex::new(LockHeap::new(config.n_cells)),
            wait_mutex: Mutex::new(()),
            metrics: LockMetrics::new(),
            trxs: TrxSet::new(),
            policy: Arc::new(FifoPolicy),
            observer: Arc::new(NullWaitObserver),
            wait_timeout_us: AtomicU64::new(config.wait_timeout.as_micros() as u64),
            deadlock_detect: AtomicBool::new(config.deadlock_detect),
            deadlock_report: Mutex::new(config.deadlock_report),
            latest_deadlock: Mutex::new(String::new()),
        }
    }

    /// Create with cluster/replication hooks installed.
    pub fn create_with_hooks(
        config: LockConfig,
        policy: Arc<dyn PriorityPolicy>,
        observer: Arc<dyn WaitObserver>,
    ) -> LockSys {
        let mut sys = LockSys::create(config);
        sys.policy = policy;
        sys.observer = observer;
        sys
    }

    /// Rebuild the three hash tables with a new cell count.
    pub fn resize(&self, n_cells: usize) {
        let mut heap = self.latch.lock();
        let heap = &mut *heap;
        let arena = &heap.arena;
        heap.rec_hash
            .rebuild(n_cells, |l| arena.get(l).rec().page_id);
        heap.prdt_hash
            .rebuild(n_cells, |l| arena.get(l).rec().page_id);
        heap.prdt_page_hash
            .rebuild(n_cells, |l| arena.get(l).rec().page_id);
    }

    /// Close the lock system at engine shutdown. All transactions must
    /// have released their locks.
    pub fn close(&self) {
        let mut heap = self.latch.lock();
        if !heap.arena.is_empty() {
            warn!(live = heap.arena.len(), "closing lock system with live locks");
        }
        let n_cells = heap.rec_hash.n_cells();
        *heap = LockHeap::new(n_cells);
    }

    pub fn trx_set(&self) -> &TrxSet {
        &self.trxs
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_micros(self.wait_timeout_us.load(Ordering::Relaxed))
    }

    pub fn set_wait_timeout(&self, timeout: Duration) {
        self.wait_timeout_us
            .store(timeout.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn deadlock_detect_enabled(&self) -> bool {
        self.deadlock_detect.load(Ordering::Relaxed)
    }

    pub fn set_deadlock_detect(&self, enabled: bool) {
        self.deadlock_detect.store(enabled, Ordering::Relaxed);
    }

    pub fn deadlock_report_mode(&self) -> DeadlockReport {
        *self.deadlock_report.lock()
    }

    pub fn set_deadlock_report(&self, mode: DeadlockReport) {
        *self.deadlock_report.lock() = mode;
    }

    /// Text of the most recently detected deadlock.
    pub fn latest_deadlock_report(&self) -> String {
        self.latest_deadlock.lock().clone()
    }

    /// Number of live record lock structures.
    pub fn n_rec_locks(&self) -> usize {
        let heap = self.latch.lock();
        heap.rec_hash.total_locks() + heap.prdt_hash.total_locks() + heap.prdt_page_hash.total_locks()
    }

    /// Number of locks (table or record) held on `table`.
    pub fn table_get_n_locks(&self, table: TableId) -> usize {
        let heap = self.latch.lock();
        heap.table_queue(table).map(|q| q.locks.len()).unwrap_or(0)
    }

    /// Whether any locks (table or record) are held against `table`.
    pub fn table_has_locks(&self, table: TableId) -> bool {
        let heap = self.latch.lock();
        heap.table_queue(table)
            .map(|q| !q.locks.is_empty() || q.n_rec_locks > 0)
            .unwrap_or(false)
    }

    /// Whether `trx` holds a granted record lock of exactly `mode_held`
    /// covering (`page_id`, `heap_no`).
    pub fn trx_holds_rec_lock(
        &self,
        trx: &crate::trx::Trx,
        page_id: PageId,
        heap_no: HeapNo,
        mode_held: crate::lock::LockMode,
    ) -> bool {
        let heap = self.latch.lock();
        heap.locks_on_rec(HashKind::Rec, page_id, heap_no)
            .into_iter()
            .any(|l| {
                let lock = heap.arena.get(l);
                lock.trx.id == trx.id && !lock.is_waiting() && lock.mode() == mode_held
            })
    }

    /// Whether `trx` holds a granted table lock on `table` stronger than
    /// or equal to `mode_held`.
    pub fn trx_holds_table_lock(
        &self,
        trx: &crate::trx::Trx,
        table: TableId,
        mode_held: crate::lock::LockMode,
    ) -> bool {
        let heap = self.latch.lock();
        crate::table::table_has(&heap, trx.id, table, mode_held)
    }

    /// Number of locks (granted or waiting, record and table) owned by
    /// `trx`.
    pub fn trx_lock_count(&self, trx: &crate::trx::Trx) -> usize {
        let heap = self.latch.lock();
        heap.trx_owned(trx.id).map(|o| o.locks.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{Lock, LockMode, LockTarget};

    #[test]
    fn test_hash_chain_order_and_resize() {
        let sys = LockSys::create(LockConfig {
            n_cells: 4,
            ..Default::default()
        });
        let trx = crate::trx::Trx::new_for_test(TrxId(9));
        let id = PageId::new(0, 42);

        let mut heap = sys.latch.lock();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let lock = Lock {
                trx: trx.clone(),
                type_mode: TypeMode::rec(LockMode::Shared),
                target: LockTarget::Rec(crate::lock::RecLock {
                    page_id: id,
                    index: IndexId(1),
                    table: TableId(1),
                    bitmap: crate::lock::Bitmap::new(8),
                    prdt: None,
                }),
            };
            let lock_id = heap.arena.alloc(lock);
            heap.rec_hash.append(id, lock_id);
            ids.push(lock_id);
        }
        assert_eq!(heap.page_chain(HashKind::Rec, id), ids);
        drop(heap);

        sys.resize(1);
        let heap = sys.latch.lock();
        assert_eq!(heap.rec_hash.n_cells(), 1);
        assert_eq!(heap.page_chain(HashKind::Rec, id), ids);
    }

    #[test]
    fn test_insert_after_splices() {
        let mut hash = LockHash::new(2);
        let id = PageId::new(0, 1);
        hash.append(id, LockId(0));
        hash.append(id, LockId(1));
        hash.insert_after(id, LockId(0), LockId(2));
        assert_eq!(hash.cell(id), &[LockId(0), LockId(2), LockId(1)]);

        hash.remove(id, LockId(2));
        assert_eq!(hash.cell(id), &[LockId(0), LockId(1)]);
    }
}
