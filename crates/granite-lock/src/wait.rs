//! Suspending a transaction until its lock is granted, cancelled, timed
//! out, or interrupted. The only blocking point in the lock manager.

use crate::deadlock;
use crate::queue;
use crate::sys::{HashKind, LockSys};
use crate::trx::Trx;
use crate::LockStatus;
use granite_common::config::LOCK_WAIT_TIMEOUT_INFINITE_SECS;
use granite_common::prelude::*;
use std::sync::Arc;
use std::time::Instant;

impl LockSys {
    /// Wait for the lock this transaction is enqueued behind.
    ///
    /// Returns `Success` once granted, `Deadlock` if the transaction was
    /// chosen as a deadlock victim, `WaitTimeout` when the deadline
    /// elapsed, or `Interrupted` when the connection was killed. Timeouts
    /// and interrupts cancel the waiting request before returning.
    pub fn wait(&self, trx: &Arc<Trx>) -> LockStatus {
        let timeout = self.wait_timeout();
        let no_timeout = timeout.as_secs() >= LOCK_WAIT_TIMEOUT_INFINITE_SECS;
        let suspend_time = Instant::now();
        let deadline = if no_timeout {
            None
        } else {
            Some(suspend_time + timeout)
        };

        let row_wait;
        {
            let wg = self.wait_mutex.lock();
            let mut wait = trx.wait.lock();

            if wait.wait_lock.is_none() {
                // The lock was already granted, or this transaction was
                // chosen as a deadlock victim and cancelled before it
                // could suspend: no need to sleep. A deadlock verdict
                // delivered early must survive into the return value.
                if wait.victim || wait.error == LockStatus::Deadlock {
                    wait.victim = false;
                    wait.error = LockStatus::Deadlock;
                    return LockStatus::Deadlock;
                }
                return LockStatus::Success;
            }

            wait.error = LockStatus::Success;
            wait.suspend_time = Some(suspend_time);
            row_wait = !wait.wait_is_table;
            drop(wait);
            if row_wait {
                self.metrics.wait_start();
            }
            drop(wg);
        }

        let mut timed_out = false;
        let mut status = LockStatus::Success;

        if deadlock::check_and_resolve(self, trx) {
            trx.wait.lock().error = LockStatus::Deadlock;
            status = LockStatus::Deadlock;
        } else {
            if self.deadlock_detect_enabled() && self.observer.wants_reports(trx) {
                self.report_waits_for(trx);
            }

            let mut wg = self.wait_mutex.lock();
            loop {
                {
                    let mut wait = trx.wait.lock();
                    if wait.wait_lock.is_none() {
                        status = wait.error;
                        break;
                    }
                    if wait.error == LockStatus::Deadlock {
                        status = LockStatus::Deadlock;
                        break;
                    }
                    if trx.is_interrupted() {
                        // Only the connection serving this transaction can
                        // deliver the kill, so the flag is stable here.
                        wait.error = LockStatus::Interrupted;
                        status = LockStatus::Interrupted;
                        break;
                    }
                }

                let Some(deadline) = deadline else {
                    trx.cond.wait(&mut wg);
                    continue;
                };
                {
                    let result = trx.cond.wait_until(&mut wg, deadline);
                    if result.timed_out() {
                        // Re-validate once: a grant may have raced the
                        // deadline.
                        let mut wait = trx.wait.lock();
                        if wait.wait_lock.is_none() {
                            status = wait.error;
                        } else if trx.is_interrupted() {
                            wait.error = LockStatus::Interrupted;
                            status = LockStatus::Interrupted;
                        } else if wait.error == LockStatus::Deadlock {
                            status = LockStatus::Deadlock;
                        } else {
                            timed_out = true;
                        }
                        break;
                    }
                }
            }
        }

        if row_wait {
            self.metrics.wait_resume(suspend_time.elapsed());
        }

        if timed_out {
            trx.wait.lock().error = LockStatus::WaitTimeout;
            status = LockStatus::WaitTimeout;
            self.metrics.timeouts.inc();
        }

        // On any non-granted outcome the waiting request is still in its
        // queue; cancel it ourselves.
        if trx.is_waiting() {
            let mut heap = self.latch.lock();
            let _wg = self.wait_mutex.lock();
            let wait_lock = trx.wait.lock().wait_lock;
            if let Some(wait_lock) = wait_lock {
                queue::cancel_waiting_and_release(self, &mut heap, wait_lock);
            }
        }

        status
    }

    /// Deliver a connection kill to a possibly waiting transaction. The
    /// waiter polls the flag on every wake-up; signalling under the wait
    /// mutex guarantees the wake-up is not lost even for an untimed wait.
    pub fn interrupt(&self, trx: &Arc<Trx>) {
        let _wg = self.wait_mutex.lock();
        trx.interrupt();
    }

    /// Check whether the transaction was already marked as a deadlock
    /// victim; otherwise cancel its pending wait, if any.
    ///
    /// Returns `Deadlock` for a victim, `Success` when there is nothing to
    /// wait for (the lock was granted in the meantime), and `Wait` after
    /// cancelling a still-pending request.
    pub fn handle_wait(&self, trx: &Arc<Trx>) -> LockStatus {
        let mut heap = self.latch.lock();
        let _wg = self.wait_mutex.lock();

        let (victim, wait_lock) = {
            let wait = trx.wait.lock();
            (wait.victim, wait.wait_lock)
        };
        if victim {
            return LockStatus::Deadlock;
        }
        let Some(wait_lock) = wait_lock else {
            // The lock was probably granted before we got here.
            return LockStatus::Success;
        };
        queue::cancel_waiting_and_release(self, &mut heap, wait_lock);
        LockStatus::Wait
    }

    /// Report every holder blocking `trx` to the wait observer, so
    /// parallel replication can recompute deadlocks in commit order.
    fn report_waits_for(&self, trx: &Arc<Trx>) {
        let heap = self.latch.lock();
        let _wg = self.wait_mutex.lock();

        let Some(wait_lock) = trx.wait.lock().wait_lock else {
            return;
        };
        let lock = heap.arena.get(wait_lock);
        debug_assert!(lock.is_waiting());

        if lock.is_table() {
            let table = lock.table_id();
            if let Some(queue) = heap.table_queue(table) {
                for &l in &queue.locks {
                    let other = heap.arena.get(l);
                    if other.mode() != crate::lock::LockMode::AutoInc && other.trx.id != trx.id {
                        self.observer.on_wait(trx, &other.trx);
                    }
                }
            }
        } else {
            let rec = lock.rec();
            let heap_no = rec.bitmap.find_set().unwrap_or(HEAP_NO_INFIMUM);
            let kind = HashKind::of(lock.type_mode);
            for l in heap.locks_on_rec(kind, rec.page_id, heap_no) {
                let other = heap.arena.get(l);
                if other.trx.id != trx.id {
                    self.observer.on_wait(trx, &other.trx);
                }
            }
        }
    }
}
