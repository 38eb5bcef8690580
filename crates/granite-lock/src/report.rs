//! Human-readable lock and deadlock reporting.

use crate::lock::{Lock, LockId};
use crate::sys::{HashKind, LockHeap, LockSys};
use crate::trx::Trx;
use granite_common::prelude::*;
use std::fmt::Write as _;
use std::sync::Arc;

pub(crate) fn describe_lock(lock: &Lock) -> String {
    if lock.is_table() {
        format!(
            "TABLE LOCK table {:?} trx {} lock mode {:?}",
            lock.table_id(),
            lock.trx.id,
            lock.type_mode
        )
    } else {
        let rec = lock.rec();
        let bits: Vec<HeapNo> = (0..rec.bitmap.n_bits())
            .filter(|&h| rec.bitmap.get(h))
            .collect();
        format!(
            "RECORD LOCKS page {} index {:?} table {:?} trx {} lock mode {:?} heap no(s) {:?}",
            rec.page_id, rec.index, rec.table, lock.trx.id, lock.type_mode, bits
        )
    }
}

fn describe_trx(heap: &LockHeap, trx: &Trx) -> String {
    let n_locks = heap
        .trx_owned(trx.id)
        .map(|o| o.locks.len())
        .unwrap_or(0);
    format!(
        "{}, {:?}, {} lock struct(s), undo log entries {}",
        trx.id,
        trx.state(),
        n_locks,
        trx.undo_entries()
    )
}

/// Locks conflicting with `wait_lock`: the granted requests ahead of it
/// on the same record or table.
fn conflicting_locks(heap: &LockHeap, wait_lock: LockId) -> Vec<LockId> {
    let lock = heap.arena.get(wait_lock);
    if lock.is_table() {
        heap.table_queue(lock.table_id())
            .map(|q| {
                q.locks
                    .iter()
                    .copied()
                    .filter(|&l| !heap.arena.get(l).is_waiting())
                    .collect()
            })
            .unwrap_or_default()
    } else {
        let rec = lock.rec();
        let Some(heap_no) = rec.bitmap.find_set() else {
            return Vec::new();
        };
        heap.locks_on_rec(HashKind::of(lock.type_mode), rec.page_id, heap_no)
            .into_iter()
            .filter(|&l| l != wait_lock && !heap.arena.get(l).is_waiting())
            .collect()
    }
}

/// Render a deadlock cycle: every member with its waiting lock, plus the
/// conflicting locks under `Full` reporting.
pub(crate) fn deadlock_report(
    heap: &LockHeap,
    members: &[Arc<Trx>],
    victim_pos: usize,
    mode: DeadlockReport,
) -> String {
    let mut out = String::new();

    for (pos, member) in members.iter().enumerate() {
        let _ = writeln!(out, "*** ({}) TRANSACTION:", pos + 1);
        let _ = writeln!(out, "{}", describe_trx(heap, member));

        let wait_lock = member.wait.lock().wait_lock;
        let Some(wait_lock) = wait_lock else {
            continue;
        };
        let _ = writeln!(out, "*** WAITING FOR THIS LOCK TO BE GRANTED:");
        let _ = writeln!(out, "{}", describe_lock(heap.arena.get(wait_lock)));

        if mode == DeadlockReport::Full {
            let conflicting = conflicting_locks(heap, wait_lock);
            if !conflicting.is_empty() {
                let _ = writeln!(out, "*** CONFLICTING WITH:");
                for l in conflicting {
                    let _ = writeln!(out, "{}", describe_lock(heap.arena.get(l)));
                }
            }
        }
    }

    let _ = writeln!(out, "*** WE ROLL BACK TRANSACTION ({})", victim_pos + 1);
    out
}

impl LockSys {
    /// One-paragraph summary of the lock system state and counters.
    pub fn print_info_summary(&self) -> String {
        let heap = self.latch.lock();
        let mut out = String::new();
        let _ = writeln!(out, "------------");
        let _ = writeln!(out, "LOCK SYSTEM");
        let _ = writeln!(out, "------------");
        let _ = writeln!(
            out,
            "{} record lock struct(s), {} table lock struct(s), {} transaction(s)",
            heap.rec_hash.total_locks()
                + heap.prdt_hash.total_locks()
                + heap.prdt_page_hash.total_locks(),
            self.metrics.tablelock_count.get(),
            self.trxs.len()
        );
        let _ = writeln!(
            out,
            "deadlocks {}, lock waits {}, pending {}, timeouts {}",
            self.metrics.deadlocks.get(),
            self.metrics.wait_count.get(),
            self.metrics.pending_waits.get(),
            self.metrics.timeouts.get()
        );
        let _ = writeln!(
            out,
            "total wait time {} us, max wait time {} us",
            self.metrics.wait_time_us.get(),
            self.metrics.wait_time_max_us.get()
        );
        let last = self.latest_deadlock.lock();
        if !last.is_empty() {
            let _ = writeln!(out, "------------------------");
            let _ = writeln!(out, "LATEST DETECTED DEADLOCK");
            let _ = writeln!(out, "------------------------");
            out.push_str(&last);
        }
        out
    }

    /// Per-transaction dump: state, wait target, and every lock held.
    pub fn print_info_all_transactions(&self) -> String {
        let heap = self.latch.lock();
        let mut out = String::new();
        let _ = writeln!(out, "LIST OF TRANSACTIONS:");

        let mut trxs: Vec<Arc<Trx>> = Vec::new();
        self.trxs.for_each(|t| trxs.push(t.clone()));
        trxs.sort_by_key(|t| t.id);

        for trx in trxs {
            let _ = writeln!(out, "---{}", describe_trx(&heap, &trx));
            let suspended = trx.wait.lock().suspend_time;
            if let Some(blocker) = trx.blocking_trx() {
                match suspended {
                    Some(since) => {
                        let _ = writeln!(
                            out,
                            "--- WAITING FOR {} ({} ms)",
                            blocker.id,
                            since.elapsed().as_millis()
                        );
                    }
                    None => {
                        let _ = writeln!(out, "--- WAITING FOR {}", blocker.id);
                    }
                }
            }
            if let Some(owned) = heap.trx_owned(trx.id) {
                for &l in &owned.locks {
                    let _ = writeln!(out, "{}", describe_lock(heap.arena.get(l)));
                }
            }
        }
        out
    }
}
