//! End-to-end lock manager scenarios: conflicts, deadlocks, timeouts,
//! and the implicit-lock bridge, driven across real threads.

use granite_common::config::LockConfig;
use granite_common::types::*;
use granite_lock::{
    GapMode, LockMode, LockStatus, LockSys, MvccReader, NoImplicitLocks, PageView,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TABLE: TableId = TableId(1);
const INDEX: IndexId = IndexId(1);

fn lock_sys() -> Arc<LockSys> {
    Arc::new(LockSys::create(LockConfig {
        wait_timeout: Duration::from_secs(10),
        ..Default::default()
    }))
}

fn page(no: u32, records: &[HeapNo]) -> PageView {
    PageView::new(PageId::new(0, no), records.to_vec())
}

fn lock_x_rec(
    sys: &LockSys,
    page: &PageView,
    heap_no: HeapNo,
    trx: &Arc<granite_lock::Trx>,
) -> LockStatus {
    sys.clust_rec_read_check_and_lock(
        page,
        heap_no,
        INDEX,
        TABLE,
        LockMode::Exclusive,
        GapMode::RecNotGap,
        trx,
        &NoImplicitLocks,
    )
}

/// Spin until `trx` is registered as waiting, so a racing thread has
/// really suspended before the test proceeds.
fn await_waiting(trx: &granite_lock::Trx) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !trx.is_waiting() {
        assert!(Instant::now() < deadline, "transaction never started waiting");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn basic_conflict_wait_then_grant() {
    let sys = lock_sys();
    let pg = page(42, &[5]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert_eq!(
        sys.lock_table(TABLE, LockMode::IntentionExclusive, &t1),
        LockStatus::Success
    );
    assert_eq!(
        sys.lock_table(TABLE, LockMode::IntentionExclusive, &t2),
        LockStatus::Success
    );

    assert_eq!(lock_x_rec(&sys, &pg, 5, &t1), LockStatus::SuccessLockedRec);
    assert_eq!(lock_x_rec(&sys, &pg, 5, &t2), LockStatus::Wait);

    let waiter = {
        let sys = sys.clone();
        let t2 = t2.clone();
        thread::spawn(move || sys.wait(&t2))
    };
    await_waiting(&t2);
    assert_eq!(t2.blocking_trx().map(|t| t.id), Some(t1.id));

    sys.release(&t1);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);

    assert!(sys.trx_holds_rec_lock(&t2, pg.page_id(), 5, LockMode::Exclusive));
    assert!(!t2.is_waiting());
    assert_eq!(sys.metrics.deadlocks.get(), 0);
    assert_eq!(sys.metrics.wait_count.get(), 1);
    assert_eq!(sys.metrics.pending_waits.get(), 0);
    sys.validate().unwrap();

    // After release(t1), nothing points at t1 anymore.
    assert_eq!(sys.trx_lock_count(&t1), 0);
    assert!(t2.blocking_trx().is_none());
}

#[test]
fn deadlock_cycle_of_two_picks_lighter_victim() {
    let sys = lock_sys();
    let pg = page(42, &[5, 7]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    // T1 has done more work: T2 should be the victim.
    t1.add_undo_entries(10);

    sys.lock_table(TABLE, LockMode::IntentionExclusive, &t1);
    sys.lock_table(TABLE, LockMode::IntentionExclusive, &t2);

    assert_eq!(lock_x_rec(&sys, &pg, 5, &t1), LockStatus::SuccessLockedRec);
    assert_eq!(lock_x_rec(&sys, &pg, 7, &t2), LockStatus::SuccessLockedRec);

    // T1 -> waits for T2's lock on heap 7.
    assert_eq!(lock_x_rec(&sys, &pg, 7, &t1), LockStatus::Wait);
    let t1_wait = {
        let sys = sys.clone();
        let t1 = t1.clone();
        thread::spawn(move || sys.wait(&t1))
    };
    await_waiting(&t1);

    // T2 -> requests T1's lock on heap 5, closing the cycle.
    assert_eq!(lock_x_rec(&sys, &pg, 5, &t2), LockStatus::Wait);
    let status = sys.wait(&t2);
    assert_eq!(status, LockStatus::Deadlock);
    assert_eq!(sys.metrics.deadlocks.get(), 1);

    // The victim rolls back; the survivor is granted.
    sys.release(&t2);
    assert_eq!(t1_wait.join().unwrap(), LockStatus::Success);
    assert!(sys.trx_holds_rec_lock(&t1, pg.page_id(), 7, LockMode::Exclusive));
    sys.validate().unwrap();
}

#[test]
fn deadlock_victim_can_be_the_other_transaction() {
    let sys = lock_sys();
    let pg = page(43, &[5, 7]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    // T2, the requester that closes the cycle, has done more work:
    // the already-waiting T1 becomes the victim.
    t2.add_undo_entries(10);

    sys.lock_table(TABLE, LockMode::IntentionExclusive, &t1);
    sys.lock_table(TABLE, LockMode::IntentionExclusive, &t2);
    assert_eq!(lock_x_rec(&sys, &pg, 5, &t1), LockStatus::SuccessLockedRec);
    assert_eq!(lock_x_rec(&sys, &pg, 7, &t2), LockStatus::SuccessLockedRec);

    assert_eq!(lock_x_rec(&sys, &pg, 7, &t1), LockStatus::Wait);
    let t1_wait = {
        let sys = sys.clone();
        let t1 = t1.clone();
        thread::spawn(move || {
            let status = sys.wait(&t1);
            // The victim rolls back on its own thread, unblocking T2.
            if status == LockStatus::Deadlock {
                sys.release(&t1);
            }
            status
        })
    };
    await_waiting(&t1);

    assert_eq!(lock_x_rec(&sys, &pg, 5, &t2), LockStatus::Wait);
    let t2_status = sys.wait(&t2);

    // T1 was cancelled as the victim and woke with a deadlock verdict;
    // T2 kept waiting until T1's locks were gone.
    assert_eq!(t1_wait.join().unwrap(), LockStatus::Deadlock);
    assert_eq!(t2_status, LockStatus::Success);
    assert!(sys.trx_holds_rec_lock(&t2, pg.page_id(), 5, LockMode::Exclusive));
    assert_eq!(sys.metrics.deadlocks.get(), 1);
    sys.validate().unwrap();
}

#[test]
fn insert_intention_waits_for_next_key_lock() {
    let sys = lock_sys();
    let pg = page(42, &[10]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    sys.lock_table(TABLE, LockMode::IntentionShared, &t1);
    sys.lock_table(TABLE, LockMode::IntentionExclusive, &t2);

    // T1 takes a next-key S lock on heap 10 (record plus the gap).
    assert_eq!(
        sys.clust_rec_read_check_and_lock(
            &pg,
            10,
            INDEX,
            TABLE,
            LockMode::Shared,
            GapMode::Ordinary,
            &t1,
            &NoImplicitLocks,
        ),
        LockStatus::SuccessLockedRec
    );

    // T2 inserts into the gap before heap 10: insert intention must wait.
    let (inherit, status) = sys.insert_check_and_lock(&pg, HEAP_NO_INFIMUM, INDEX, TABLE, &t2);
    assert!(inherit);
    assert_eq!(status, LockStatus::Wait);

    let waiter = {
        let sys = sys.clone();
        let t2 = t2.clone();
        thread::spawn(move || sys.wait(&t2))
    };
    await_waiting(&t2);

    sys.release(&t1);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);
    assert_eq!(sys.metrics.deadlocks.get(), 0);
    sys.validate().unwrap();
}

#[test]
fn two_insert_intentions_do_not_conflict() {
    let sys = lock_sys();
    let pg = page(42, &[10]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t3 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    // T1 holds the next-key lock; T2 queues an insert intention.
    sys.clust_rec_read_check_and_lock(
        &pg,
        10,
        INDEX,
        TABLE,
        LockMode::Shared,
        GapMode::Ordinary,
        &t1,
        &NoImplicitLocks,
    );
    let (_, status) = sys.insert_check_and_lock(&pg, HEAP_NO_INFIMUM, INDEX, TABLE, &t2);
    assert_eq!(status, LockStatus::Wait);

    // T3's insert intention does not queue behind T2's: it waits for T1
    // only. With T1 gone both proceed.
    let w2 = {
        let sys = sys.clone();
        let t2 = t2.clone();
        thread::spawn(move || sys.wait(&t2))
    };
    await_waiting(&t2);

    let (_, status3) = sys.insert_check_and_lock(&pg, HEAP_NO_INFIMUM, INDEX, TABLE, &t3);
    assert_eq!(status3, LockStatus::Wait);
    let w3 = {
        let sys = sys.clone();
        let t3 = t3.clone();
        thread::spawn(move || sys.wait(&t3))
    };
    await_waiting(&t3);

    sys.release(&t1);
    assert_eq!(w2.join().unwrap(), LockStatus::Success);
    assert_eq!(w3.join().unwrap(), LockStatus::Success);
    assert_eq!(sys.metrics.deadlocks.get(), 0);
    sys.validate().unwrap();
}

#[test]
fn lock_wait_timeout_cancels_the_waiter() {
    let sys = lock_sys();
    sys.set_wait_timeout(Duration::from_millis(50));
    let pg = page(42, &[5]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert_eq!(lock_x_rec(&sys, &pg, 5, &t1), LockStatus::SuccessLockedRec);
    assert_eq!(lock_x_rec(&sys, &pg, 5, &t2), LockStatus::Wait);

    let started = Instant::now();
    let status = sys.wait(&t2);
    assert_eq!(status, LockStatus::WaitTimeout);
    assert!(started.elapsed() >= Duration::from_millis(50));

    // The waiter cancelled itself; the holder is untouched.
    assert!(sys.trx_holds_rec_lock(&t1, pg.page_id(), 5, LockMode::Exclusive));
    assert!(!t2.is_waiting());
    assert_eq!(sys.metrics.pending_waits.get(), 0);
    assert_eq!(sys.metrics.timeouts.get(), 1);
    sys.validate().unwrap();
}

#[test]
fn interrupt_wakes_the_waiter() {
    let sys = lock_sys();
    let pg = page(42, &[5]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert_eq!(lock_x_rec(&sys, &pg, 5, &t1), LockStatus::SuccessLockedRec);
    assert_eq!(lock_x_rec(&sys, &pg, 5, &t2), LockStatus::Wait);

    let waiter = {
        let sys = sys.clone();
        let t2 = t2.clone();
        thread::spawn(move || sys.wait(&t2))
    };
    await_waiting(&t2);

    sys.interrupt(&t2);
    assert_eq!(waiter.join().unwrap(), LockStatus::Interrupted);
    assert!(!t2.is_waiting());
    assert!(sys.trx_holds_rec_lock(&t1, pg.page_id(), 5, LockMode::Exclusive));
    sys.validate().unwrap();
}

struct OneImplicitHolder {
    holder: TrxId,
}

impl MvccReader for OneImplicitHolder {
    fn clust_implicit_holder(&self, _: IndexId, _: PageId, _: HeapNo) -> Option<TrxId> {
        Some(self.holder)
    }

    fn sec_implicit_holder(&self, _: IndexId, _: PageId, _: HeapNo) -> Option<TrxId> {
        None
    }
}

#[test]
fn implicit_lock_promoted_to_explicit_on_conflict() {
    let sys = lock_sys();
    let pg = page(42, &[5]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let mvcc = OneImplicitHolder { holder: t1.id };

    // T1 modified the record but holds no explicit lock. T2's locking
    // read promotes T1's claim and then queues behind it.
    let status = sys.clust_rec_read_check_and_lock(
        &pg,
        5,
        INDEX,
        TABLE,
        LockMode::Shared,
        GapMode::RecNotGap,
        &t2,
        &mvcc,
    );
    assert_eq!(status, LockStatus::Wait);
    assert!(sys.trx_holds_rec_lock(&t1, pg.page_id(), 5, LockMode::Exclusive));

    let waiter = {
        let sys = sys.clone();
        let t2 = t2.clone();
        thread::spawn(move || sys.wait(&t2))
    };
    await_waiting(&t2);

    sys.release(&t1);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);
    assert!(sys.trx_holds_rec_lock(&t2, pg.page_id(), 5, LockMode::Shared));
    sys.validate().unwrap();
}

#[test]
fn implicit_holder_is_caller_itself() {
    let sys = lock_sys();
    let pg = page(42, &[5]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let mvcc = OneImplicitHolder { holder: t1.id };

    // The caller already holds the implicit lock: no explicit lock is
    // created at all.
    let status =
        sys.clust_rec_modify_check_and_lock(&pg, 5, INDEX, TABLE, &t1, &mvcc);
    assert_eq!(status, LockStatus::Success);
    assert_eq!(sys.metrics.reclock_created.get(), 0);
    sys.validate().unwrap();
}

#[test]
fn corrupted_modifier_id_is_ignored() {
    let sys = lock_sys();
    let pg = page(42, &[5]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    // An id the allocator never handed out: the record is corrupted and
    // treated as having no implicit holder.
    let mvcc = OneImplicitHolder {
        holder: TrxId(1_000_000),
    };

    let status = sys.clust_rec_read_check_and_lock(
        &pg,
        5,
        INDEX,
        TABLE,
        LockMode::Shared,
        GapMode::RecNotGap,
        &t1,
        &mvcc,
    );
    assert_eq!(status, LockStatus::SuccessLockedRec);
    sys.validate().unwrap();
}

#[test]
fn stronger_lock_subsumes_weaker_request() {
    let sys = lock_sys();
    let pg = page(42, &[5]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert_eq!(lock_x_rec(&sys, &pg, 5, &t1), LockStatus::SuccessLockedRec);
    let created = sys.metrics.reclock_created.get();

    // An S request on the same record is covered by the X lock.
    let status = sys.clust_rec_read_check_and_lock(
        &pg,
        5,
        INDEX,
        TABLE,
        LockMode::Shared,
        GapMode::RecNotGap,
        &t1,
        &NoImplicitLocks,
    );
    assert_eq!(status, LockStatus::Success);
    assert_eq!(sys.metrics.reclock_created.get(), created);
    sys.validate().unwrap();
}

#[test]
fn table_lock_subsumes_record_request() {
    let sys = lock_sys();
    let pg = page(42, &[5]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert_eq!(
        sys.lock_table(TABLE, LockMode::Exclusive, &t1),
        LockStatus::Success
    );
    // The table X lock covers every record; no record lock is created.
    assert_eq!(lock_x_rec(&sys, &pg, 5, &t1), LockStatus::Success);
    assert_eq!(sys.metrics.reclock_created.get(), 0);
    sys.validate().unwrap();
}

#[test]
fn supremum_request_drops_rec_not_gap() {
    let sys = lock_sys();
    let pg = page(42, &[5]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    let status = sys.clust_rec_read_check_and_lock(
        &pg,
        HEAP_NO_SUPREMUM,
        INDEX,
        TABLE,
        LockMode::Shared,
        GapMode::RecNotGap,
        &t1,
        &NoImplicitLocks,
    );
    assert!(status.is_success());
    // Invariant: the supremum never carries a REC_NOT_GAP lock.
    sys.validate().unwrap();
}

#[test]
fn handle_wait_cancel_is_idempotent() {
    let sys = lock_sys();
    let pg = page(42, &[5]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert_eq!(lock_x_rec(&sys, &pg, 5, &t1), LockStatus::SuccessLockedRec);
    assert_eq!(lock_x_rec(&sys, &pg, 5, &t2), LockStatus::Wait);

    // First call cancels the pending wait, the second finds nothing to do.
    assert_eq!(sys.handle_wait(&t2), LockStatus::Wait);
    assert_eq!(sys.handle_wait(&t2), LockStatus::Success);
    assert!(!t2.is_waiting());
    sys.validate().unwrap();
}

#[test]
fn read_committed_early_unlock_regrants() {
    let sys = lock_sys();
    let pg = page(42, &[5]);
    let t1 = sys.trx_set().begin(IsolationLevel::ReadCommitted);
    let t2 = sys.trx_set().begin(IsolationLevel::ReadCommitted);

    assert_eq!(lock_x_rec(&sys, &pg, 5, &t1), LockStatus::SuccessLockedRec);
    assert_eq!(lock_x_rec(&sys, &pg, 5, &t2), LockStatus::Wait);

    let waiter = {
        let sys = sys.clone();
        let t2 = t2.clone();
        thread::spawn(move || sys.wait(&t2))
    };
    await_waiting(&t2);

    // The row did not match T1's predicate: unlock just this record.
    sys.rec_unlock(&t1, pg.page_id(), 5, LockMode::Exclusive);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);
    assert!(sys.trx_holds_rec_lock(&t2, pg.page_id(), 5, LockMode::Exclusive));
    sys.validate().unwrap();
}

#[test]
fn deadlock_detection_disabled_falls_back_to_timeout() {
    let sys = lock_sys();
    sys.set_deadlock_detect(false);
    sys.set_wait_timeout(Duration::from_millis(50));
    let pg = page(42, &[5, 7]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert_eq!(lock_x_rec(&sys, &pg, 5, &t1), LockStatus::SuccessLockedRec);
    assert_eq!(lock_x_rec(&sys, &pg, 7, &t2), LockStatus::SuccessLockedRec);
    assert_eq!(lock_x_rec(&sys, &pg, 7, &t1), LockStatus::Wait);

    let t1_wait = {
        let sys = sys.clone();
        let t1 = t1.clone();
        thread::spawn(move || sys.wait(&t1))
    };
    await_waiting(&t1);

    assert_eq!(lock_x_rec(&sys, &pg, 5, &t2), LockStatus::Wait);
    // No detector: both waits run into the timeout.
    assert_eq!(sys.wait(&t2), LockStatus::WaitTimeout);
    assert_eq!(t1_wait.join().unwrap(), LockStatus::WaitTimeout);
    assert_eq!(sys.metrics.deadlocks.get(), 0);
    sys.validate().unwrap();
}

#[test]
fn deadlock_report_lists_cycle_and_victim() {
    let sys = lock_sys();
    let pg = page(42, &[5, 7]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    t1.add_undo_entries(10);

    assert_eq!(lock_x_rec(&sys, &pg, 5, &t1), LockStatus::SuccessLockedRec);
    assert_eq!(lock_x_rec(&sys, &pg, 7, &t2), LockStatus::SuccessLockedRec);
    assert_eq!(lock_x_rec(&sys, &pg, 7, &t1), LockStatus::Wait);

    let t1_wait = {
        let sys = sys.clone();
        let t1 = t1.clone();
        thread::spawn(move || sys.wait(&t1))
    };
    await_waiting(&t1);

    assert_eq!(lock_x_rec(&sys, &pg, 5, &t2), LockStatus::Wait);
    assert_eq!(sys.wait(&t2), LockStatus::Deadlock);

    let report = sys.latest_deadlock_report();
    assert!(report.contains("TRANSACTION"));
    assert!(report.contains("WAITING FOR THIS LOCK TO BE GRANTED"));
    assert!(report.contains("CONFLICTING WITH"));
    assert!(report.contains("WE ROLL BACK TRANSACTION"));

    let summary = sys.print_info_summary();
    assert!(summary.contains("LATEST DETECTED DEADLOCK"));

    sys.release(&t2);
    t1_wait.join().unwrap();
}
