//! Lock system invariant checks. Cheap enough to run from tests after
//! every scenario; the storage engine runs them in debug builds only.

use crate::lock::LockId;
use crate::mode;
use crate::sys::{HashKind, LockSys};
use granite_common::prelude::*;

impl LockSys {
    /// Validate the whole lock system. Returns `Err` with a description
    /// of the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        let heap = self.latch.lock();

        let fail = |msg: String| -> Result<()> { Err(Error::internal(msg)) };

        for (lock_id, lock) in heap.arena.iter() {
            let trx = &lock.trx;

            // Every lock is back-traceable from its transaction.
            let owned = heap
                .trx_owned(trx.id)
                .ok_or_else(|| Error::internal(format!("{} owns no lock list", trx.id)))?;
            if !owned.locks.contains(&lock_id) {
                return fail(format!(
                    "lock {:?} missing from the lock list of {}",
                    lock_id, trx.id
                ));
            }

            if lock.is_table() {
                // Table locks are in their table's queue and in the
                // transaction's table-lock vector.
                let table = lock.table_id();
                let in_queue = heap
                    .table_queue(table)
                    .map(|q| q.locks.contains(&lock_id))
                    .unwrap_or(false);
                if !in_queue {
                    return fail(format!("table lock {:?} missing from its queue", lock_id));
                }
                if !owned.table_locks.contains(&Some(lock_id)) {
                    return fail(format!(
                        "table lock {:?} missing from the table-lock vector of {}",
                        lock_id, trx.id
                    ));
                }
            } else {
                let rec = lock.rec();
                let kind = HashKind::of(lock.type_mode);
                if !heap.page_chain(kind, rec.page_id).contains(&lock_id) {
                    return fail(format!(
                        "record lock {:?} missing from the chain of {}",
                        lock_id, rec.page_id
                    ));
                }
                if lock.is_waiting() && rec.bitmap.count_set() != 1 {
                    return fail(format!(
                        "waiting lock {:?} has {} bits set",
                        lock_id,
                        rec.bitmap.count_set()
                    ));
                }
                if lock.type_mode.is_record_not_gap() && rec.bitmap.get(HEAP_NO_SUPREMUM) {
                    return fail(format!(
                        "lock {:?} holds REC_NOT_GAP on the supremum",
                        lock_id
                    ));
                }
            }

            // A waiting lock is its transaction's wait lock and the
            // blocking transaction really blocks it.
            if lock.is_waiting() {
                let wait = trx.wait.lock();
                if wait.wait_lock != Some(lock_id) {
                    return fail(format!(
                        "waiting lock {:?} is not the wait lock of {}",
                        lock_id, trx.id
                    ));
                }
                let Some(blocker) = wait.wait_trx.clone() else {
                    return fail(format!("{} waits without a blocking transaction", trx.id));
                };
                drop(wait);
                let blocked_by_real_lock = heap.arena.iter().any(|(other_id, other)| {
                    other_id != lock_id
                        && other.trx.id == blocker.id
                        && conflicts_on_same_target(&heap, lock_id, other_id)
                        && mode::has_to_wait(&*self.policy, lock, other)
                });
                if !blocked_by_real_lock {
                    return fail(format!(
                        "{} waits for {} which holds no conflicting lock",
                        trx.id, blocker.id
                    ));
                }
            }
        }

        // Granted record locks on the same record by different owners are
        // compatible, gap-disjoint, or insert intentions.
        let pairs_ok = granted_pairs_consistent(&heap, self);
        if let Err(msg) = pairs_ok {
            return fail(msg);
        }

        Ok(())
    }
}

fn conflicts_on_same_target(
    heap: &crate::sys::LockHeap,
    waiter: LockId,
    holder: LockId,
) -> bool {
    let w = heap.arena.get(waiter);
    let h = heap.arena.get(holder);
    if w.is_table() || h.is_table() {
        return w.is_table() && h.is_table() && w.table_id() == h.table_id();
    }
    let (wr, hr) = (w.rec(), h.rec());
    if wr.page_id != hr.page_id {
        return false;
    }
    match wr.bitmap.find_set() {
        Some(heap_no) => hr.bitmap.get(heap_no),
        None => false,
    }
}

fn granted_pairs_consistent(
    heap: &crate::sys::LockHeap,
    sys: &LockSys,
) -> std::result::Result<(), String> {
    // Predicate locks conflict geometrically and are checked by their own
    // wait rule, not by the mode matrix.
    let granted: Vec<(LockId, &crate::lock::Lock)> = heap
        .arena
        .iter()
        .filter(|(_, l)| {
            !l.is_table()
                && !l.is_waiting()
                && !l.type_mode.is_predicate()
                && !l.type_mode.is_predicate_page()
        })
        .collect();

    for (i, &(a_id, a)) in granted.iter().enumerate() {
        for &(b_id, b) in granted.iter().skip(i + 1) {
            if a.trx.id == b.trx.id {
                continue;
            }
            let (ar, br) = (a.rec(), b.rec());
            if ar.page_id != br.page_id {
                continue;
            }
            for heap_no in 0..ar.bitmap.n_bits().min(br.bitmap.n_bits()) {
                if !(ar.bitmap.get(heap_no) && br.bitmap.get(heap_no)) {
                    continue;
                }
                let compatible = mode::compatible(a.mode(), b.mode());
                let gap_disjoint = a.type_mode.is_gap() != b.type_mode.is_gap()
                    || heap_no == HEAP_NO_SUPREMUM;
                let insert_intention =
                    a.type_mode.is_insert_intention() || b.type_mode.is_insert_intention();
                let order_waived = sys.policy.order_before(&a.trx, &b.trx)
                    || sys.policy.order_before(&b.trx, &a.trx);
                let pure_gap = a.type_mode.is_gap() && b.type_mode.is_gap();
                if !(compatible || gap_disjoint || insert_intention || pure_gap || order_waived) {
                    return Err(format!(
                        "incompatible granted locks {:?} and {:?} on heap {}",
                        a_id, b_id, heap_no
                    ));
                }
            }
        }
    }
    Ok(())
}
