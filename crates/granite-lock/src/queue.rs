//! Record lock queues: conflict scan, enqueue, grant, and dequeue.

use crate::lock::{Bitmap, Lock, LockId, LockMode, LockTarget, RecLock, TypeMode};
use crate::mode;
use crate::page::PageView;
use crate::predicate::Mbr;
use crate::sys::{HashKind, LockHeap, LockSys};
use crate::trx::Trx;
use crate::LockStatus;
use granite_common::prelude::*;
use std::sync::Arc;

/// Extra bitmap headroom beyond the page's heap count at allocation time.
/// Records inserted after allocation land in the margin; beyond it, the
/// out-of-range bits read as unset.
const BITMAP_MARGIN: usize = 64;

/// Allocate a record lock and add it to the queue of its page.
/// Does NOT check for deadlocks or conflicts.
#[allow(clippy::too_many_arguments)]
pub(crate) fn create_rec_lock(
    sys: &LockSys,
    heap: &mut LockHeap,
    type_mode: TypeMode,
    page: &PageView,
    heap_no: HeapNo,
    index: IndexId,
    table: TableId,
    trx: &Arc<Trx>,
    c_trx: Option<&Arc<Trx>>,
    splice_after: Option<LockId>,
    prdt: Option<Mbr>,
) -> LockId {
    let mut type_mode = type_mode;
    if heap_no == HEAP_NO_SUPREMUM && !type_mode.is_predicate() && !type_mode.is_predicate_page() {
        // A lock on the supremum is always a gap lock; the qualifier
        // flags would only force a second lock object for nothing.
        type_mode = type_mode.without(TypeMode::GAP | TypeMode::REC_NOT_GAP);
    }
    let mut bitmap = Bitmap::new(page.heap_count() + BITMAP_MARGIN);
    bitmap.set(heap_no);

    let page_id = page.page_id();
    let kind = HashKind::of(type_mode);
    let id = heap.arena.alloc(Lock {
        trx: trx.clone(),
        type_mode,
        target: LockTarget::Rec(RecLock {
            page_id,
            index,
            table,
            bitmap,
            prdt,
        }),
    });

    match splice_after {
        Some(after) => heap.hash_mut(kind).insert_after(page_id, after, id),
        None => heap.hash_mut(kind).append(page_id, id),
    }
    heap.table_queue_mut(table).n_rec_locks += 1;
    heap.trx_owned_mut(trx.id).locks.push(id);

    if type_mode.is_waiting() {
        let mut wait = trx.wait.lock();
        if wait.wait_trx.is_none() {
            debug_assert!(c_trx.is_some());
            wait.wait_trx = c_trx.map(Arc::clone);
        }
        wait.wait_lock = Some(id);
        wait.wait_is_table = false;
    }

    sys.metrics.reclock_created.inc();
    sys.metrics.reclock_count.inc();
    id
}

/// Look for a GRANTED lock on (`id`, `heap_no`) held by `trx` that is
/// stronger than or equal to `precise_mode`. A request on the supremum is
/// always regarded as a gap-type request.
pub(crate) fn has_expl(
    heap: &LockHeap,
    precise_mode: TypeMode,
    id: PageId,
    heap_no: HeapNo,
    trx: TrxId,
) -> Option<LockId> {
    heap.locks_on_rec(HashKind::Rec, id, heap_no)
        .into_iter()
        .find(|&l| {
            let lock = heap.arena.get(l);
            lock.trx.id == trx
                && !lock.is_waiting()
                && !lock.type_mode.is_insert_intention()
                && (!lock.type_mode.is_record_not_gap()
                    || precise_mode.is_record_not_gap()
                    || heap_no == HEAP_NO_SUPREMUM)
                && (!lock.type_mode.is_gap()
                    || precise_mode.is_gap()
                    || heap_no == HEAP_NO_SUPREMUM)
                && mode::stronger_or_equal(lock.mode(), precise_mode.mode())
        })
}

/// First lock by another transaction that forces a request with `mode` on
/// (`id`, `heap_no`) to wait.
pub(crate) fn other_has_conflicting(
    sys: &LockSys,
    heap: &LockHeap,
    mode_requested: TypeMode,
    id: PageId,
    heap_no: HeapNo,
    trx: &Arc<Trx>,
) -> Option<LockId> {
    let is_supremum = heap_no == HEAP_NO_SUPREMUM;
    heap.locks_on_rec(HashKind::Rec, id, heap_no)
        .into_iter()
        .find(|&l| {
            mode::rec_has_to_wait(
                &*sys.policy,
                trx,
                mode_requested,
                heap.arena.get(l),
                is_supremum,
            )
        })
}

/// A lock by the same transaction with identical `type_mode` on the same
/// page whose bitmap can cover `heap_no`. Reusing it saves allocating a
/// second lock structure ("similar lock reuse").
fn find_similar_on_page(
    heap: &LockHeap,
    type_mode: TypeMode,
    heap_no: HeapNo,
    id: PageId,
    trx: TrxId,
) -> Option<LockId> {
    heap.page_chain(HashKind::of(type_mode), id)
        .into_iter()
        .find(|&l| {
            let lock = heap.arena.get(l);
            lock.trx.id == trx
                && lock.type_mode == type_mode
                && lock.rec().bitmap.n_bits() > heap_no
        })
}

/// Enqueue a waiting request that cannot be granted immediately.
#[allow(clippy::too_many_arguments)]
pub(crate) fn enqueue_waiting(
    sys: &LockSys,
    heap: &mut LockHeap,
    c_lock: LockId,
    type_mode: TypeMode,
    page: &PageView,
    heap_no: HeapNo,
    index: IndexId,
    table: TableId,
    trx: &Arc<Trx>,
    prdt: Option<Mbr>,
) -> LockStatus {
    if sys.wait_timeout().is_zero() {
        trx.wait.lock().error = LockStatus::WaitTimeout;
        return LockStatus::WaitTimeout;
    }

    let c_trx = heap.arena.get(c_lock).trx.clone();
    // A priority waiter is spliced right behind the conflicting lock
    // instead of joining the queue tail.
    let splice_after = if sys.policy.is_priority(trx) {
        Some(c_lock)
    } else {
        None
    };
    create_rec_lock(
        sys,
        heap,
        type_mode.with(TypeMode::WAIT),
        page,
        heap_no,
        index,
        table,
        trx,
        Some(&c_trx),
        splice_after,
        prdt,
    );
    trx.wait.lock().victim = false;

    debug!(trx = %trx.id, page = %page.page_id(), heap_no, "waiting for record lock");
    LockStatus::Wait
}

/// Add a record lock request to the queue. Reuses an existing lock object
/// by the same transaction when the record has no waiters; otherwise
/// creates a fresh object. This low-level path checks neither conflicts
/// nor deadlocks.
#[allow(clippy::too_many_arguments)]
pub(crate) fn add_to_queue(
    sys: &LockSys,
    heap: &mut LockHeap,
    mut type_mode: TypeMode,
    page: &PageView,
    heap_no: HeapNo,
    index: IndexId,
    table: TableId,
    trx: &Arc<Trx>,
) {
    // All locks on the supremum are gap-type; dropping the qualifier flags
    // lets such requests share one lock object.
    if heap_no == HEAP_NO_SUPREMUM {
        debug_assert!(!type_mode.is_record_not_gap());
        type_mode = type_mode.without(TypeMode::GAP | TypeMode::REC_NOT_GAP);
    }

    if !type_mode.is_waiting() {
        let kind = HashKind::of(type_mode);
        let chain = heap.page_chain(kind, page.page_id());
        if !chain.is_empty() {
            let rec_has_waiter = chain.iter().any(|&l| {
                let lock = heap.arena.get(l);
                lock.is_waiting() && lock.rec().bitmap.get(heap_no)
            });
            if !rec_has_waiter {
                if let Some(similar) =
                    find_similar_on_page(heap, type_mode, heap_no, page.page_id(), trx.id)
                {
                    heap.arena.get_mut(similar).rec_mut().bitmap.set(heap_no);
                    return;
                }
            }
        }
    } else {
        // Only a waiting lock that is being moved between pages arrives
        // here; its transaction already knows what it waits for.
        debug_assert!(trx.wait.lock().wait_trx.is_some());
    }

    create_rec_lock(
        sys, heap, type_mode, page, heap_no, index, table, trx, None, None, None,
    );
}

/// Try to lock (`page`, `heap_no`) in the given mode; enqueue a waiting
/// request on conflict. Looks only at explicit locks. With `impl_only`
/// no lock is created when no wait is necessary: the caller will rely on
/// an implicit lock instead.
#[allow(clippy::too_many_arguments)]
pub(crate) fn lock_rec(
    sys: &LockSys,
    impl_only: bool,
    mode_requested: TypeMode,
    page: &PageView,
    heap_no: HeapNo,
    index: IndexId,
    table: TableId,
    trx: &Arc<Trx>,
) -> LockStatus {
    debug_assert!(matches!(
        mode_requested.mode(),
        LockMode::Shared | LockMode::Exclusive
    ));
    debug_assert!(!(mode_requested.is_gap() && mode_requested.is_record_not_gap()));

    // A request on the supremum is really a gap request whatever the
    // caller asked for; normalizing here keeps one lock object per
    // (transaction, page, mode) on the supremum.
    let mode_requested = if heap_no == HEAP_NO_SUPREMUM {
        mode_requested.without(TypeMode::GAP | TypeMode::REC_NOT_GAP)
    } else {
        mode_requested
    };

    let mut heap = sys.latch.lock();

    // A table lock strong enough already covers the record.
    if crate::table::table_has(&heap, trx.id, table, mode_requested.mode()) {
        return LockStatus::Success;
    }

    let id = page.page_id();
    let Some(first) = heap.first_lock_on_page(HashKind::Rec, id) else {
        // No locks on the page: simplified and faster path.
        if !impl_only {
            create_rec_lock(
                sys,
                &mut heap,
                mode_requested,
                page,
                heap_no,
                index,
                table,
                trx,
                None,
                None,
                None,
            );
        }
        return LockStatus::SuccessLockedRec;
    };

    let single_fit = {
        let chain = heap.page_chain(HashKind::Rec, id);
        let lock = heap.arena.get(first);
        chain.len() == 1
            && lock.trx.id == trx.id
            && lock.type_mode == mode_requested
            && lock.rec().bitmap.n_bits() > heap_no
    };

    if single_fit {
        if !impl_only && heap.arena.get_mut(first).rec_mut().bitmap.set(heap_no) {
            return LockStatus::SuccessLockedRec;
        }
        return LockStatus::Success;
    }

    // Do nothing if the transaction already has a strong enough lock.
    if has_expl(&heap, mode_requested, id, heap_no, trx.id).is_some() {
        return LockStatus::Success;
    }

    if let Some(c_lock) = other_has_conflicting(sys, &heap, mode_requested, id, heap_no, trx) {
        // Another transaction has a conflicting request in the queue and
        // this transaction holds nothing strong enough: wait.
        enqueue_waiting(
            sys,
            &mut heap,
            c_lock,
            mode_requested,
            page,
            heap_no,
            index,
            table,
            trx,
            None,
        )
    } else if !impl_only {
        add_to_queue(
            sys,
            &mut heap,
            mode_requested,
            page,
            heap_no,
            index,
            table,
            trx,
        );
        LockStatus::SuccessLockedRec
    } else {
        LockStatus::Success
    }
}

/// The lock that a waiting record lock request still has to wait for, or
/// `None` when every blocker ahead of it in the queue is gone.
pub(crate) fn has_to_wait_in_queue(
    sys: &LockSys,
    heap: &LockHeap,
    wait_lock: LockId,
) -> Option<LockId> {
    let waiter = heap.arena.get(wait_lock);
    debug_assert!(waiter.is_waiting());
    let heap_no = waiter.rec().bitmap.find_set()?;
    let page_id = waiter.rec().page_id;
    let kind = HashKind::of(waiter.type_mode);

    for l in heap.page_chain(kind, page_id) {
        if l == wait_lock {
            break;
        }
        let lock = heap.arena.get(l);
        if lock.rec().bitmap.get(heap_no) && mode::has_to_wait(&*sys.policy, waiter, lock) {
            return Some(l);
        }
    }
    None
}

/// Clear the waiting state of `lock_id` and detach it from its
/// transaction. Does not signal the waiter.
pub(crate) fn reset_lock_and_trx_wait(heap: &mut LockHeap, lock_id: LockId) -> Arc<Trx> {
    let lock = heap.arena.get_mut(lock_id);
    lock.type_mode = lock.type_mode.without(TypeMode::WAIT);
    let trx = lock.trx.clone();
    let mut wait = trx.wait.lock();
    if wait.wait_lock == Some(lock_id) {
        wait.wait_lock = None;
        wait.wait_trx = None;
    }
    drop(wait);
    trx
}

/// Release a transaction from its lock wait: propagate a pending victim
/// verdict into the error slot and wake the sleeping thread.
/// Caller holds the wait mutex.
pub(crate) fn wait_end(trx: &Arc<Trx>) {
    let mut wait = trx.wait.lock();
    if wait.victim {
        wait.victim = false;
        wait.error = LockStatus::Deadlock;
    }
    drop(wait);
    trx.cond.notify_all();
}

/// Grant a waiting lock request and wake the waiting transaction.
/// Caller holds the latch and the wait mutex.
pub(crate) fn grant(_sys: &LockSys, heap: &mut LockHeap, lock_id: LockId) {
    let (is_autoinc, table_id) = {
        let lock = heap.arena.get(lock_id);
        (
            lock.is_table() && lock.mode() == LockMode::AutoInc,
            lock.table_id(),
        )
    };
    let trx = reset_lock_and_trx_wait(heap, lock_id);

    if is_autoinc {
        let queue = heap.table_queue_mut(table_id);
        debug_assert!(queue.autoinc_trx.is_none());
        queue.autoinc_trx = Some(trx.id);
        heap.trx_owned_mut(trx.id).autoinc_locks.push(Some(lock_id));
    }

    debug!(trx = %trx.id, "lock wait ends");
    wait_end(&trx);
}

/// Cancel a waiting record lock request and release the waiting
/// transaction. Does NOT re-grant queued requests behind it.
/// Caller holds the latch but not the wait mutex.
pub(crate) fn rec_cancel(sys: &LockSys, heap: &mut LockHeap, lock_id: LockId) {
    {
        let lock = heap.arena.get_mut(lock_id);
        debug_assert!(!lock.is_table() && lock.is_waiting());
        // A waiting lock has exactly one bit set.
        if let Some(h) = lock.rec().bitmap.find_set() {
            lock.rec_mut().bitmap.reset(h);
        }
    }
    let _wg = sys.wait_mutex.lock();
    let trx = reset_lock_and_trx_wait(heap, lock_id);
    wait_end(&trx);
}

/// Remove a record lock, waiting or granted, from its queue and its
/// transaction, and free it. No re-grant.
pub(crate) fn rec_discard(sys: &LockSys, heap: &mut LockHeap, lock_id: LockId) {
    let (page_id, kind, table, trx_id) = {
        let lock = heap.arena.get(lock_id);
        (
            lock.rec().page_id,
            HashKind::of(lock.type_mode),
            lock.rec().table,
            lock.trx.id,
        )
    };
    heap.hash_mut(kind).remove(page_id, lock_id);
    heap.trx_owned_mut(trx_id).locks.retain(|&l| l != lock_id);
    let queue = heap.table_queue_mut(table);
    queue.n_rec_locks = queue.n_rec_locks.saturating_sub(1);
    heap.arena.free(lock_id);
    sys.metrics.reclock_removed.inc();
    sys.metrics.reclock_count.dec();
}

/// Remove a record lock from its page queue and grant queued waiters that
/// are no longer blocked, in chain order. Still-blocked waiters get their
/// waits-for edge repointed at the surviving blocker.
/// Caller holds the latch and the wait mutex.
pub(crate) fn dequeue_from_page(sys: &LockSys, heap: &mut LockHeap, in_lock: LockId) {
    let (page_id, kind) = {
        let lock = heap.arena.get(in_lock);
        (lock.rec().page_id, HashKind::of(lock.type_mode))
    };
    rec_discard(sys, heap, in_lock);

    for l in heap.page_chain(kind, page_id) {
        if !heap.arena.get(l).is_waiting() {
            continue;
        }
        if let Some(c) = has_to_wait_in_queue(sys, heap, l) {
            let c_trx = heap.arena.get(c).trx.clone();
            let w_trx = heap.arena.get(l).trx.clone();
            w_trx.wait.lock().wait_trx = Some(c_trx);
        } else {
            grant(sys, heap, l);
        }
    }
}

/// Reset the lock bits for one record in one hash table, cancelling
/// waiters parked on it.
pub(crate) fn reset_and_release_wait_low(
    sys: &LockSys,
    heap: &mut LockHeap,
    kind: HashKind,
    id: PageId,
    heap_no: HeapNo,
) {
    for l in heap.locks_on_rec(kind, id, heap_no) {
        if heap.arena.get(l).is_waiting() {
            rec_cancel(sys, heap, l);
        } else {
            heap.arena.get_mut(l).rec_mut().bitmap.reset(heap_no);
        }
    }
}

/// Reset the lock bits for one record in every hash table. Predicate
/// locks all live on the page infimum.
pub(crate) fn reset_and_release_wait(
    sys: &LockSys,
    heap: &mut LockHeap,
    id: PageId,
    heap_no: HeapNo,
) {
    reset_and_release_wait_low(sys, heap, HashKind::Rec, id, heap_no);
    reset_and_release_wait_low(sys, heap, HashKind::Prdt, id, HEAP_NO_INFIMUM);
    reset_and_release_wait_low(sys, heap, HashKind::PrdtPage, id, HEAP_NO_INFIMUM);
}

/// Cancel a waiting lock request (record or table), release its queue
/// slot, re-grant successors, and wake the waiter.
/// Caller holds the latch and the wait mutex.
pub(crate) fn cancel_waiting_and_release(sys: &LockSys, heap: &mut LockHeap, lock_id: LockId) {
    let trx = heap.arena.get(lock_id).trx.clone();
    debug_assert_eq!(trx.state(), crate::trx::TrxState::Active);

    if !heap.arena.get(lock_id).is_table() {
        dequeue_from_page(sys, heap, lock_id);
    } else {
        if heap
            .trx_owned(trx.id)
            .map(|o| o.holds_autoinc())
            .unwrap_or(false)
        {
            crate::table::release_autoinc_locks(sys, heap, &trx);
        }
        crate::table::table_dequeue(sys, heap, lock_id);
    }

    {
        let mut wait = trx.wait.lock();
        wait.wait_lock = None;
        wait.wait_trx = None;
    }
    wait_end(&trx);
}

impl LockSys {
    /// Check for conflicts before inserting a record after `rec`. Acquires
    /// an insert-intention gap claim on the successor when other
    /// transactions hold locks there. The returned flag tells the caller
    /// whether the inserted record may need to inherit gap locks from the
    /// successor.
    pub fn insert_check_and_lock(
        &self,
        page: &PageView,
        rec: HeapNo,
        index: IndexId,
        table: TableId,
        trx: &Arc<Trx>,
    ) -> (bool, LockStatus) {
        let next = page.next_heap_no(rec);
        let mut heap = self.latch.lock();

        if heap
            .locks_on_rec(HashKind::Rec, page.page_id(), next)
            .is_empty()
        {
            // No explicit locks on the successor: the common case.
            return (false, LockStatus::Success);
        }

        // A gap lock by another transaction on the successor, waiting or
        // granted, blocks the insert. A waiting gap lock placed by another
        // inserter does not: two pending inserts into the same gap must
        // not deadlock each other.
        let type_mode =
            TypeMode::rec(LockMode::Exclusive).with(TypeMode::GAP | TypeMode::INSERT_INTENTION);

        let status = if let Some(c_lock) =
            other_has_conflicting(self, &heap, type_mode, page.page_id(), next, trx)
        {
            enqueue_waiting(
                self, &mut heap, c_lock, type_mode, page, next, index, table, trx, None,
            )
        } else {
            LockStatus::Success
        };

        (true, status.collapse_locked_rec())
    }

    /// Release a record lock that is no longer needed, e.g. under READ
    /// COMMITTED when a non-matching row is unlocked, and grant queued
    /// waiters that become unblocked.
    pub fn rec_unlock(&self, trx: &Arc<Trx>, page_id: PageId, heap_no: HeapNo, mode: LockMode) {
        debug_assert!(!trx.is_waiting());
        let mut heap = self.latch.lock();

        let found = heap
            .locks_on_rec(HashKind::Rec, page_id, heap_no)
            .into_iter()
            .find(|&l| {
                let lock = heap.arena.get(l);
                lock.trx.id == trx.id && lock.mode() == mode && !lock.is_waiting()
            });

        let Some(found) = found else {
            error!(
                trx = %trx.id, %page_id, heap_no, %mode,
                "unlock row could not find a lock of this mode on the record"
            );
            return;
        };

        heap.arena.get_mut(found).rec_mut().bitmap.reset(heap_no);

        let _wg = self.wait_mutex.lock();
        for l in heap.locks_on_rec(HashKind::Rec, page_id, heap_no) {
            if !heap.arena.get(l).is_waiting() {
                continue;
            }
            if let Some(c) = has_to_wait_in_queue(self, &heap, l) {
                let c_trx = heap.arena.get(c).trx.clone();
                let w_trx = heap.arena.get(l).trx.clone();
                w_trx.wait.lock().wait_trx = Some(c_trx);
            } else {
                grant(self, &mut heap, l);
            }
        }
    }
}
