//! Table locks: intention modes, the AUTO_INC stack, queue maintenance,
//! and bulk release at transaction end.

use crate::lock::{Lock, LockId, LockMode, LockTarget, TypeMode};
use crate::mode;
use crate::queue;
use crate::sys::{LockHeap, LockSys};
use crate::trx::Trx;
use crate::LockStatus;
use granite_common::prelude::*;
use std::sync::Arc;

/// Whether `trx` holds a granted table lock on `table` stronger than or
/// equal to `mode`.
pub(crate) fn table_has(heap: &LockHeap, trx: TrxId, table: TableId, mode_req: LockMode) -> bool {
    let Some(owned) = heap.trx_owned(trx) else {
        return false;
    };
    owned.table_locks.iter().flatten().any(|&l| {
        let lock = heap.arena.get(l);
        lock.table_id() == table
            && !lock.is_waiting()
            && mode::stronger_or_equal(lock.mode(), mode_req)
    })
}

/// Create a table lock and add it as the last in the table's queue (or
/// spliced behind the conflicting lock for a priority waiter). Does NOT
/// check for deadlocks or compatibility.
pub(crate) fn create_table_lock(
    sys: &LockSys,
    heap: &mut LockHeap,
    table: TableId,
    type_mode: TypeMode,
    trx: &Arc<Trx>,
    c_lock: Option<LockId>,
) -> LockId {
    debug_assert!(type_mode.is_table());

    let id = heap.arena.alloc(Lock {
        trx: trx.clone(),
        type_mode,
        target: LockTarget::Table(table),
    });

    let splice_after = if type_mode.is_waiting() && sys.policy.is_priority(trx) {
        c_lock
    } else {
        None
    };

    let queue = heap.table_queue_mut(table);
    match type_mode.mode() {
        LockMode::AutoInc => {
            queue.n_waiting_or_granted_autoinc += 1;
            if !type_mode.is_waiting() {
                debug_assert!(queue.autoinc_trx.is_none());
                queue.autoinc_trx = Some(trx.id);
            }
        }
        LockMode::Shared | LockMode::Exclusive => queue.n_lock_x_or_s += 1,
        _ => {}
    }
    match splice_after.and_then(|c| queue.locks.iter().position(|&l| l == c)) {
        Some(pos) => queue.locks.insert(pos + 1, id),
        None => queue.locks.push(id),
    }

    let owned = heap.trx_owned_mut(trx.id);
    owned.locks.push(id);
    owned.table_locks.push(Some(id));
    if type_mode.mode() == LockMode::AutoInc && !type_mode.is_waiting() {
        owned.autoinc_locks.push(Some(id));
    }

    if type_mode.is_waiting() {
        let c_trx = c_lock.map(|c| heap.arena.get(c).trx.clone());
        let mut wait = trx.wait.lock();
        if wait.wait_trx.is_none() {
            debug_assert!(c_trx.is_some());
            wait.wait_trx = c_trx;
        }
        wait.wait_lock = Some(id);
        wait.wait_is_table = true;
    }

    sys.metrics.tablelock_created.inc();
    sys.metrics.tablelock_count.inc();
    id
}

/// First lock by another transaction in the table queue that is
/// incompatible with a `mode_req` request by `trx`. With `wait` false,
/// waiting locks are ignored.
pub(crate) fn other_has_incompatible(
    heap: &LockHeap,
    trx: TrxId,
    wait: bool,
    table: TableId,
    mode_req: LockMode,
) -> Option<LockId> {
    let queue = heap.table_queue(table)?;

    // IS and IX conflict only with S/X; when none are queued the scan can
    // be skipped entirely.
    if matches!(
        mode_req,
        LockMode::IntentionShared | LockMode::IntentionExclusive
    ) && queue.n_lock_x_or_s == 0
    {
        return None;
    }

    queue.locks.iter().rev().copied().find(|&l| {
        let lock = heap.arena.get(l);
        lock.trx.id != trx
            && !mode::compatible(lock.mode(), mode_req)
            && (wait || !lock.is_waiting())
    })
}

/// Enqueue a waiting table lock request.
fn enqueue_waiting(
    sys: &LockSys,
    heap: &mut LockHeap,
    mode_req: LockMode,
    table: TableId,
    trx: &Arc<Trx>,
    c_lock: LockId,
) -> LockStatus {
    if sys.wait_timeout().is_zero() {
        trx.wait.lock().error = LockStatus::WaitTimeout;
        return LockStatus::WaitTimeout;
    }

    create_table_lock(
        sys,
        heap,
        table,
        TypeMode::table(mode_req).with(TypeMode::WAIT),
        trx,
        Some(c_lock),
    );
    trx.wait.lock().victim = false;

    debug!(trx = %trx.id, ?table, %mode_req, "waiting for table lock");
    LockStatus::Wait
}

/// The lock a waiting table lock request still has to wait for.
pub(crate) fn has_to_wait_in_queue(
    sys: &LockSys,
    heap: &LockHeap,
    wait_lock: LockId,
) -> Option<LockId> {
    let waiter = heap.arena.get(wait_lock);
    debug_assert!(waiter.is_waiting() && waiter.is_table());
    let table = waiter.table_id();
    let queue = heap.table_queue(table)?;

    if matches!(
        waiter.mode(),
        LockMode::IntentionShared | LockMode::IntentionExclusive
    ) && queue.n_lock_x_or_s == 0
    {
        return None;
    }

    for &l in &queue.locks {
        if l == wait_lock {
            break;
        }
        if mode::has_to_wait(&*sys.policy, waiter, heap.arena.get(l)) {
            return Some(l);
        }
    }
    None
}

/// Pop trailing `None` gap entries plus the top entry off the AUTO_INC
/// stack.
fn pop_autoinc_locks(heap: &mut LockHeap, trx: TrxId) {
    let owned = heap.trx_owned_mut(trx);
    debug_assert!(!owned.autoinc_locks.is_empty());
    loop {
        owned.autoinc_locks.pop();
        match owned.autoinc_locks.last() {
            Some(None) => continue,
            _ => return,
        }
    }
}

/// Remove one granted AUTO_INC lock from the transaction's stack. The
/// stack is released in reverse acquisition order; a lock freed from the
/// middle (a table dropped mid-statement) leaves a `None` gap instead.
fn remove_autoinc_lock(heap: &mut LockHeap, lock_id: LockId, trx: TrxId) {
    let top_matches = {
        let owned = heap.trx_owned_mut(trx);
        debug_assert!(!owned.autoinc_locks.is_empty());
        owned.autoinc_locks.last() == Some(&Some(lock_id))
    };

    if top_matches {
        // The default fast case: locks leave in reverse acquisition order.
        pop_autoinc_locks(heap, trx);
        return;
    }

    // A table dropped mid-statement frees a lock from within the stack;
    // it leaves a gap instead of shifting the entries above it.
    let owned = heap.trx_owned_mut(trx);
    let pos = owned.autoinc_locks.iter().position(|&l| l == Some(lock_id));
    match pos {
        Some(pos) => owned.autoinc_locks[pos] = None,
        None => unreachable!("autoinc lock missing from its stack"),
    }
}

/// Remove a table lock from the queue and the transaction's lists; a
/// low-level step that does not re-grant waiting requests.
pub(crate) fn table_remove_low(sys: &LockSys, heap: &mut LockHeap, lock_id: LockId) {
    let (table, trx_id, mode_held, waiting) = {
        let lock = heap.arena.get(lock_id);
        (
            lock.table_id(),
            lock.trx.id,
            lock.mode(),
            lock.is_waiting(),
        )
    };

    match mode_held {
        LockMode::AutoInc => {
            let granted_here = {
                let queue = heap.table_queue_mut(table);
                debug_assert_eq!(queue.autoinc_trx == Some(trx_id), !waiting);
                queue.n_waiting_or_granted_autoinc -= 1;
                queue.autoinc_trx == Some(trx_id)
            };
            if granted_here {
                heap.table_queue_mut(table).autoinc_trx = None;
                remove_autoinc_lock(heap, lock_id, trx_id);
            }
        }
        LockMode::Shared | LockMode::Exclusive => {
            heap.table_queue_mut(table).n_lock_x_or_s -= 1;
        }
        _ => {}
    }

    heap.table_queue_mut(table).locks.retain(|&l| l != lock_id);
    let owned = heap.trx_owned_mut(trx_id);
    owned.locks.retain(|&l| l != lock_id);
    for entry in owned.table_locks.iter_mut() {
        if *entry == Some(lock_id) {
            *entry = None;
        }
    }
    heap.arena.free(lock_id);

    sys.metrics.tablelock_removed.inc();
    sys.metrics.tablelock_count.dec();
}

/// Remove a table lock, waiting or granted, from the queue, and grant
/// queued requests behind it that become entitled to the lock.
/// Caller holds the latch and the wait mutex.
pub(crate) fn table_dequeue(sys: &LockSys, heap: &mut LockHeap, in_lock: LockId) {
    debug_assert!(heap.arena.get(in_lock).is_table());
    let table = heap.arena.get(in_lock).table_id();
    let mode_held = heap.arena.get(in_lock).mode();

    let successors: Vec<LockId> = {
        let queue = heap.table_queue_mut(table);
        match queue.locks.iter().position(|&l| l == in_lock) {
            Some(pos) => queue.locks[pos + 1..].to_vec(),
            None => Vec::new(),
        }
    };

    table_remove_low(sys, heap, in_lock);

    if matches!(
        mode_held,
        LockMode::IntentionShared | LockMode::IntentionExclusive
    ) && heap
        .table_queue(table)
        .map(|q| q.n_lock_x_or_s == 0)
        .unwrap_or(true)
    {
        // Releasing an intention lock cannot unblock anyone unless an S/X
        // request is queued.
        return;
    }

    for l in successors {
        if !heap.arena.get(l).is_waiting() {
            continue;
        }
        if let Some(c) = has_to_wait_in_queue(sys, heap, l) {
            let c_trx = heap.arena.get(c).trx.clone();
            let w_trx = heap.arena.get(l).trx.clone();
            w_trx.wait.lock().wait_trx = Some(c_trx);
        } else {
            queue::grant(sys, heap, l);
        }
    }
}

/// Release every granted AUTO_INC lock of `trx`, newest first.
/// Caller holds the latch and the wait mutex.
pub(crate) fn release_autoinc_locks(sys: &LockSys, heap: &mut LockHeap, trx: &Arc<Trx>) {
    loop {
        let top = heap
            .trx_owned(trx.id)
            .and_then(|o| o.autoinc_locks.iter().rev().flatten().next().copied());
        match top {
            Some(lock_id) => {
                debug_assert!(!heap.arena.get(lock_id).is_waiting());
                table_dequeue(sys, heap, lock_id);
            }
            None => return,
        }
    }
}

impl LockSys {
    /// Lock `table` in the given mode; enqueue a waiting request on
    /// conflict.
    pub fn lock_table(&self, table: TableId, mode_req: LockMode, trx: &Arc<Trx>) -> LockStatus {
        let mut heap = self.latch.lock();

        // Look for an equal or stronger lock the transaction already has.
        if table_has(&heap, trx.id, table, mode_req) {
            return LockStatus::Success;
        }

        match other_has_incompatible(&heap, trx.id, true, table, mode_req) {
            Some(c_lock) => enqueue_waiting(self, &mut heap, mode_req, table, trx, c_lock),
            None => {
                create_table_lock(self, &mut heap, table, TypeMode::table(mode_req), trx, None);
                LockStatus::Success
            }
        }
    }

    /// Lock `table` for `trx`, blocking in place until granted or failed.
    /// The SQL layer's helper for DDL-style table locking.
    pub fn lock_table_for_trx(
        &self,
        table: TableId,
        trx: &Arc<Trx>,
        mode_req: LockMode,
    ) -> LockStatus {
        loop {
            let status = self.lock_table(table, mode_req, trx);
            if status != LockStatus::Wait {
                return status;
            }
            let status = self.wait(trx);
            if status != LockStatus::Success {
                return status;
            }
        }
    }

    /// Create a granted table lock for a transaction resurrected during
    /// recovery. Nothing can conflict with it: recovery is single-threaded.
    pub fn lock_table_resurrect(&self, table: TableId, trx: &Arc<Trx>, mode_req: LockMode) {
        debug_assert!(matches!(
            mode_req,
            LockMode::Exclusive | LockMode::IntentionExclusive
        ));
        let mut heap = self.latch.lock();
        if table_has(&heap, trx.id, table, mode_req) {
            return;
        }
        debug_assert!(other_has_incompatible(&heap, trx.id, true, table, mode_req).is_none());
        create_table_lock(self, &mut heap, table, TypeMode::table(mode_req), trx, None);
    }

    /// Release a granted table X lock early, e.g. after rolling back an
    /// insert into an empty table.
    pub fn lock_table_x_unlock(&self, table: TableId, trx: &Arc<Trx>) {
        let mut heap = self.latch.lock();
        let _wg = self.wait_mutex.lock();

        let found = heap.trx_owned(trx.id).and_then(|o| {
            o.table_locks.iter().flatten().copied().find(|&l| {
                let lock = heap.arena.get(l);
                lock.table_id() == table
                    && lock.mode() == LockMode::Exclusive
                    && !lock.is_waiting()
            })
        });
        match found {
            Some(lock_id) => table_dequeue(self, &mut heap, lock_id),
            None => error!(trx = %trx.id, ?table, "table X lock not found for early unlock"),
        }
    }

    /// Release AUTO_INC locks at the end of a statement, in reverse
    /// acquisition order.
    pub fn unlock_table_autoinc(&self, trx: &Arc<Trx>) {
        debug_assert!(!trx.is_waiting());
        let mut heap = self.latch.lock();
        if heap
            .trx_owned(trx.id)
            .map(|o| o.holds_autoinc())
            .unwrap_or(false)
        {
            let _wg = self.wait_mutex.lock();
            release_autoinc_locks(self, &mut heap, trx);
        }
    }

    /// Release all locks of a committing or aborting transaction and wake
    /// every waiter that becomes unblocked.
    pub fn release(&self, trx: &Arc<Trx>) {
        let mut count = 0usize;
        let mut heap = self.latch.lock();
        let mut wg = self.wait_mutex.lock();

        loop {
            let last = heap.trx_owned(trx.id).and_then(|o| o.locks.last().copied());
            let Some(lock_id) = last else {
                break;
            };

            if heap.arena.get(lock_id).is_table() {
                table_dequeue(self, &mut heap, lock_id);
            } else {
                queue::dequeue_from_page(self, &mut heap, lock_id);
            }

            count += 1;
            if count % 1000 == 0 {
                // Release the mutexes for a while so a long release does
                // not monopolize the lock system.
                drop(wg);
                drop(heap);
                heap = self.latch.lock();
                wg = self.wait_mutex.lock();
            }
        }

        heap.trx_owned.remove(&trx.id);
        drop(wg);
        drop(heap);

        debug!(trx = %trx.id, released = count, "released all locks");
    }
}
