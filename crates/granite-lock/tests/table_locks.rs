//! Table-level locking: intention modes, AUTO_INC, resurrection, and
//! early X unlock.

use granite_common::config::LockConfig;
use granite_common::types::*;
use granite_lock::{LockMode, LockStatus, LockSys};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TABLE: TableId = TableId(7);

fn lock_sys() -> Arc<LockSys> {
    Arc::new(LockSys::create(LockConfig {
        wait_timeout: Duration::from_secs(10),
        ..Default::default()
    }))
}

fn await_waiting(trx: &granite_lock::Trx) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !trx.is_waiting() {
        assert!(Instant::now() < deadline, "transaction never started waiting");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn intention_modes_coexist_but_x_blocks() {
    let sys = lock_sys();
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t3 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert_eq!(
        sys.lock_table(TABLE, LockMode::IntentionShared, &t1),
        LockStatus::Success
    );
    assert_eq!(
        sys.lock_table(TABLE, LockMode::IntentionExclusive, &t2),
        LockStatus::Success
    );
    assert_eq!(
        sys.lock_table(TABLE, LockMode::Exclusive, &t3),
        LockStatus::Wait
    );

    let waiter = {
        let sys = sys.clone();
        let t3 = t3.clone();
        thread::spawn(move || sys.wait(&t3))
    };
    await_waiting(&t3);

    sys.release(&t1);
    assert!(t3.is_waiting());
    sys.release(&t2);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);
    assert!(sys.trx_holds_table_lock(&t3, TABLE, LockMode::Exclusive));
    sys.validate().unwrap();
}

#[test]
fn repeat_request_reuses_existing_lock() {
    let sys = lock_sys();
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert_eq!(
        sys.lock_table(TABLE, LockMode::Exclusive, &t1),
        LockStatus::Success
    );
    let created = sys.metrics.tablelock_created.get();

    // X subsumes everything; no further structures appear.
    for mode in [
        LockMode::IntentionShared,
        LockMode::IntentionExclusive,
        LockMode::Shared,
        LockMode::Exclusive,
    ] {
        assert_eq!(sys.lock_table(TABLE, mode, &t1), LockStatus::Success);
    }
    assert_eq!(sys.metrics.tablelock_created.get(), created);
    sys.validate().unwrap();
}

#[test]
fn waiters_are_granted_in_queue_order() {
    let sys = lock_sys();
    let holder = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let a = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let b = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert_eq!(
        sys.lock_table(TABLE, LockMode::Exclusive, &holder),
        LockStatus::Success
    );
    assert_eq!(sys.lock_table(TABLE, LockMode::Shared, &a), LockStatus::Wait);
    let wa = {
        let sys = sys.clone();
        let a = a.clone();
        thread::spawn(move || sys.wait(&a))
    };
    await_waiting(&a);
    assert_eq!(sys.lock_table(TABLE, LockMode::Shared, &b), LockStatus::Wait);
    let wb = {
        let sys = sys.clone();
        let b = b.clone();
        thread::spawn(move || sys.wait(&b))
    };
    await_waiting(&b);

    // Both shared requests are compatible once the X holder is gone, and
    // a single release grants them together, in chain order.
    sys.release(&holder);
    assert_eq!(wa.join().unwrap(), LockStatus::Success);
    assert_eq!(wb.join().unwrap(), LockStatus::Success);
    assert!(sys.trx_holds_table_lock(&a, TABLE, LockMode::Shared));
    assert!(sys.trx_holds_table_lock(&b, TABLE, LockMode::Shared));
    sys.validate().unwrap();
}

#[test]
fn autoinc_is_exclusive_and_released_at_statement_end() {
    let sys = lock_sys();
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert_eq!(
        sys.lock_table(TABLE, LockMode::AutoInc, &t1),
        LockStatus::Success
    );
    // AUTO_INC is compatible with intention modes but not with itself.
    assert_eq!(
        sys.lock_table(TABLE, LockMode::IntentionExclusive, &t2),
        LockStatus::Success
    );
    assert_eq!(
        sys.lock_table(TABLE, LockMode::AutoInc, &t2),
        LockStatus::Wait
    );

    let waiter = {
        let sys = sys.clone();
        let t2 = t2.clone();
        thread::spawn(move || sys.wait(&t2))
    };
    await_waiting(&t2);

    // Statement end releases T1's AUTO_INC without touching the rest.
    sys.unlock_table_autoinc(&t1);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);
    assert!(sys.trx_holds_table_lock(&t2, TABLE, LockMode::AutoInc));
    sys.validate().unwrap();
}

#[test]
fn autoinc_stack_releases_in_reverse_order() {
    let sys = lock_sys();
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let tables = [TableId(11), TableId(12), TableId(13)];

    for table in tables {
        assert_eq!(
            sys.lock_table(table, LockMode::AutoInc, &t1),
            LockStatus::Success
        );
    }
    for table in tables {
        assert!(sys.trx_holds_table_lock(&t1, table, LockMode::AutoInc));
    }

    sys.unlock_table_autoinc(&t1);
    for table in tables {
        assert!(!sys.trx_holds_table_lock(&t1, table, LockMode::AutoInc));
        assert!(!sys.table_has_locks(table));
    }
    sys.validate().unwrap();
}

#[test]
fn lock_table_for_trx_blocks_until_granted() {
    let sys = lock_sys();
    let holder = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert_eq!(
        sys.lock_table(TABLE, LockMode::Shared, &holder),
        LockStatus::Success
    );

    let blocked = {
        let sys = sys.clone();
        let t1 = t1.clone();
        thread::spawn(move || sys.lock_table_for_trx(TABLE, &t1, LockMode::Exclusive))
    };
    await_waiting(&t1);

    sys.release(&holder);
    assert_eq!(blocked.join().unwrap(), LockStatus::Success);
    assert!(sys.trx_holds_table_lock(&t1, TABLE, LockMode::Exclusive));
    sys.validate().unwrap();
}

#[test]
fn resurrected_table_lock_is_granted_directly() {
    let sys = lock_sys();
    let recovered = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    sys.lock_table_resurrect(TABLE, &recovered, LockMode::Exclusive);
    assert!(sys.trx_holds_table_lock(&recovered, TABLE, LockMode::Exclusive));

    // A second resurrection of the same lock is a no-op.
    sys.lock_table_resurrect(TABLE, &recovered, LockMode::Exclusive);
    assert_eq!(sys.table_get_n_locks(TABLE), 1);
    sys.validate().unwrap();
}

#[test]
fn early_table_x_unlock_wakes_waiters() {
    let sys = lock_sys();
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert_eq!(
        sys.lock_table(TABLE, LockMode::Exclusive, &t1),
        LockStatus::Success
    );
    assert_eq!(sys.lock_table(TABLE, LockMode::Shared, &t2), LockStatus::Wait);

    let waiter = {
        let sys = sys.clone();
        let t2 = t2.clone();
        thread::spawn(move || sys.wait(&t2))
    };
    await_waiting(&t2);

    // Rolling back an insert into an empty table drops the X lock early.
    sys.lock_table_x_unlock(TABLE, &t1);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);
    assert!(!sys.trx_holds_table_lock(&t1, TABLE, LockMode::Exclusive));
    sys.validate().unwrap();
}

#[test]
fn table_lock_counters_track_queue() {
    let sys = lock_sys();
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert!(!sys.table_has_locks(TABLE));
    sys.lock_table(TABLE, LockMode::IntentionShared, &t1);
    sys.lock_table(TABLE, LockMode::IntentionShared, &t2);
    assert_eq!(sys.table_get_n_locks(TABLE), 2);
    assert!(sys.table_has_locks(TABLE));

    sys.release(&t1);
    sys.release(&t2);
    assert_eq!(sys.table_get_n_locks(TABLE), 0);
    assert!(!sys.table_has_locks(TABLE));
    assert_eq!(sys.metrics.tablelock_count.get(), 0);
    sys.validate().unwrap();
}
