//! Cluster/replication hook behavior: priority queue splicing, the
//! fixed-commit-order gap waiver, and wait reporting.

use granite_common::config::LockConfig;
use granite_common::types::*;
use granite_lock::{
    GapMode, LockMode, LockStatus, LockSys, NoImplicitLocks, NullWaitObserver, PageView,
    PriorityPolicy, Trx, WaitObserver,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TABLE: TableId = TableId(1);
const INDEX: IndexId = IndexId(1);

fn page(no: u32, records: &[HeapNo]) -> PageView {
    PageView::new(PageId::new(0, no), records.to_vec())
}

fn await_waiting(trx: &Trx) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !trx.is_waiting() {
        assert!(Instant::now() < deadline, "transaction never started waiting");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Marks a fixed set of transactions as must-win writers.
struct MarkedPriority {
    marked: Mutex<HashSet<TrxId>>,
}

impl PriorityPolicy for MarkedPriority {
    fn is_priority(&self, trx: &Trx) -> bool {
        self.marked.lock().contains(&trx.id)
    }
}

/// Commit order is already fixed between every pair of transactions, as
/// parallel replication does on a replica.
struct OrderFixed;

impl PriorityPolicy for OrderFixed {
    fn order_before(&self, _a: &Trx, _b: &Trx) -> bool {
        true
    }
}

#[derive(Default)]
struct RecordingObserver {
    pairs: Mutex<Vec<(TrxId, TrxId)>>,
}

impl WaitObserver for RecordingObserver {
    fn wants_reports(&self, _trx: &Trx) -> bool {
        true
    }

    fn on_wait(&self, waiter: &Trx, holder: &Trx) {
        self.pairs.lock().push((waiter.id, holder.id));
    }
}

#[test]
fn priority_waiter_jumps_the_queue() {
    let policy = Arc::new(MarkedPriority {
        marked: Mutex::new(HashSet::new()),
    });
    let sys = Arc::new(LockSys::create_with_hooks(
        LockConfig {
            wait_timeout: Duration::from_secs(10),
            ..Default::default()
        },
        policy.clone(),
        Arc::new(NullWaitObserver),
    ));
    let pg = page(42, &[5]);

    let holder = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let normal = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let brute_force = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    policy.marked.lock().insert(brute_force.id);

    let lock_x = |trx: &Arc<Trx>| {
        sys.clust_rec_read_check_and_lock(
            &pg,
            5,
            INDEX,
            TABLE,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            trx,
            &NoImplicitLocks,
        )
    };

    assert_eq!(lock_x(&holder), LockStatus::SuccessLockedRec);
    assert_eq!(lock_x(&normal), LockStatus::Wait);
    let w_normal = {
        let sys = sys.clone();
        let normal = normal.clone();
        thread::spawn(move || sys.wait(&normal))
    };
    await_waiting(&normal);

    // The priority waiter is spliced ahead of the ordinary one.
    assert_eq!(lock_x(&brute_force), LockStatus::Wait);
    let w_bf = {
        let sys = sys.clone();
        let bf = brute_force.clone();
        thread::spawn(move || sys.wait(&bf))
    };
    await_waiting(&brute_force);

    sys.release(&holder);
    assert_eq!(w_bf.join().unwrap(), LockStatus::Success);
    assert!(sys.trx_holds_rec_lock(&brute_force, pg.page_id(), 5, LockMode::Exclusive));
    // The ordinary waiter is now queued behind the priority one.
    assert!(normal.is_waiting());

    sys.release(&brute_force);
    assert_eq!(w_normal.join().unwrap(), LockStatus::Success);
    sys.validate().unwrap();
}

#[test]
fn fixed_commit_order_waives_gap_wait() {
    let sys = Arc::new(LockSys::create_with_hooks(
        LockConfig::default(),
        Arc::new(OrderFixed),
        Arc::new(NullWaitObserver),
    ));
    let pg = page(42, &[10]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    // T1 next-key locks record 10. Ordinarily T2's insert intention into
    // the gap would wait; with the commit order pre-decided the gap
    // conflict is waived.
    assert!(sys
        .clust_rec_read_check_and_lock(
            &pg,
            10,
            INDEX,
            TABLE,
            LockMode::Shared,
            GapMode::Ordinary,
            &t1,
            &NoImplicitLocks,
        )
        .is_success());

    let (inherit, status) = sys.insert_check_and_lock(&pg, HEAP_NO_INFIMUM, INDEX, TABLE, &t2);
    assert!(inherit);
    assert_eq!(status, LockStatus::Success);
    sys.validate().unwrap();
}

#[test]
fn wait_observer_sees_every_blocking_holder() {
    let observer = Arc::new(RecordingObserver::default());
    let sys = Arc::new(LockSys::create_with_hooks(
        LockConfig {
            wait_timeout: Duration::from_secs(10),
            ..Default::default()
        },
        Arc::new(granite_lock::FifoPolicy),
        observer.clone(),
    ));
    let pg = page(42, &[5]);
    let t1 = sys.trx_set().begin(IsolationLevel::RepeatableRead);
    let t2 = sys.trx_set().begin(IsolationLevel::RepeatableRead);

    assert!(sys
        .clust_rec_read_check_and_lock(
            &pg,
            5,
            INDEX,
            TABLE,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            &t1,
            &NoImplicitLocks,
        )
        .is_success());
    assert_eq!(
        sys.clust_rec_read_check_and_lock(
            &pg,
            5,
            INDEX,
            TABLE,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            &t2,
            &NoImplicitLocks,
        ),
        LockStatus::Wait
    );

    let waiter = {
        let sys = sys.clone();
        let t2 = t2.clone();
        thread::spawn(move || sys.wait(&t2))
    };
    await_waiting(&t2);

    sys.release(&t1);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);

    let pairs = observer.pairs.lock().clone();
    assert!(pairs.contains(&(t2.id, t1.id)));
    sys.validate().unwrap();
}
