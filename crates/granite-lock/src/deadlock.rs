//! Online deadlock detection over the waits-for graph.
//!
//! Every waiting transaction has exactly one outgoing edge, its
//! `wait_trx`, so the graph is a functional graph and a cycle can be
//! found with Brent's tortoise-and-hare walk in O(cycle length) without
//! any marking.

use crate::queue;
use crate::report;
use crate::sys::{LockHeap, LockSys};
use crate::trx::{Trx, TrxState};
use granite_common::prelude::*;
use std::sync::Arc;

/// Quickly detect a deadlock reachable from `trx` using Brent's cycle
/// detection algorithm. Returns a transaction that is part of the cycle.
///
/// Normally `trx` is itself part of any cycle found, but if detection had
/// been disabled in the past, `trx` may be waiting on the edge of a
/// pre-existing cycle it does not belong to. Caller holds the wait mutex.
pub(crate) fn find_cycle(sys: &LockSys, trx: &Arc<Trx>) -> Option<Arc<Trx>> {
    // The walk is bounded by twice the number of live transactions: a
    // functional graph walk must have entered its cycle by then.
    let cap = 2 * sys.trxs.len().max(1) + 2;

    let mut tortoise = trx.clone();
    let mut hare = trx.clone();
    let mut power = 1usize;
    let mut length = 1usize;

    for _ in 0..cap {
        let next = hare.wait.lock().wait_trx.clone()?;
        hare = next;
        if Arc::ptr_eq(&tortoise, &hare) {
            debug_assert!(length > 1 || Arc::ptr_eq(&hare, trx));
            return Some(hare);
        }
        if length == power {
            power <<= 1;
            length = 0;
            tortoise = hare.clone();
        }
        length += 1;
    }
    None
}

/// Deadlock victim weight. Transactions that have modified
/// non-transactional tables cannot be rolled back meaningfully, so they
/// get the top bit and are avoided.
fn weight(heap: &LockHeap, trx: &Trx) -> u64 {
    let held = heap
        .trx_owned(trx.id)
        .map(|o| o.locks.len() as u64)
        .unwrap_or(0);
    let w = trx.undo_entries().saturating_add(held);
    if trx.has_nontrans_updates() {
        w | 1u64 << 63
    } else {
        w
    }
}

/// Report a cycle in the waits-for graph and resolve it by cancelling the
/// wait of a minimum-weight member.
///
/// Returns the transaction to be rolled back, or `None` when the cycle no
/// longer exists. Called without either mutex; reacquires both in
/// standard order, which is why the caller must re-check afterwards.
fn resolve(sys: &LockSys, trx: &Arc<Trx>) -> Option<Arc<Trx>> {
    let mut heap = sys.latch.lock();
    let _wg = sys.wait_mutex.lock();

    // The wait mutex was released on the way here; the cycle may already
    // have been broken by another thread.
    let cycle = find_cycle(sys, trx)?;
    sys.metrics.deadlocks.inc();

    // Walk the cycle once, collecting members in positional order.
    let mut members: Vec<Arc<Trx>> = Vec::new();
    let mut next = cycle.clone();
    loop {
        let hop = next.wait.lock().wait_trx.clone()?;
        members.push(hop.clone());
        if Arc::ptr_eq(&hop, &cycle) {
            break;
        }
        next = hop;
    }

    let mut victim = members[0].clone();
    let mut victim_weight = weight(&heap, &victim);
    let mut victim_pos = 0usize;
    for (pos, member) in members.iter().enumerate().skip(1) {
        let member_weight = weight(&heap, member);
        if member_weight < victim_weight {
            victim_weight = member_weight;
            victim = member.clone();
            victim_pos = pos;
        }
    }

    // Positional tie-break: when the requester is in the cycle with the
    // minimal weight, prefer it, so that an equal-weight peer is not
    // starved by repeated re-detection.
    if !Arc::ptr_eq(&victim, trx) && weight(&heap, trx) == victim_weight {
        if let Some(pos) = members.iter().position(|m| Arc::ptr_eq(m, trx)) {
            victim = trx.clone();
            victim_pos = pos;
        }
    }

    let mode = sys.deadlock_report_mode();
    if mode != DeadlockReport::Off {
        let text = report::deadlock_report(&heap, &members, victim_pos, mode);
        warn!(victim = %victim.id, cycle_len = members.len(), "deadlock detected");
        *sys.latest_deadlock.lock() = text;
    }

    debug_assert_eq!(victim.state(), TrxState::Active);

    if !Arc::ptr_eq(&victim, trx) {
        let wait_lock = {
            let mut wait = victim.wait.lock();
            wait.victim = true;
            wait.wait_lock
        };
        if let Some(wait_lock) = wait_lock {
            queue::cancel_waiting_and_release(sys, &mut heap, wait_lock);
        }
    }

    Some(victim)
}

/// Check if the lock wait `trx` just entered results in a deadlock, and
/// resolve it by choosing a victim. Returns whether `trx` itself must
/// report a deadlock.
pub(crate) fn check_and_resolve(sys: &LockSys, trx: &Arc<Trx>) -> bool {
    debug_assert_eq!(trx.state(), TrxState::Active);

    {
        let _wg = sys.wait_mutex.lock();
        if !sys.deadlock_detect_enabled() {
            return false;
        }
        if find_cycle(sys, trx).is_none() {
            return trx.was_chosen_as_victim();
        }
    }

    match resolve(sys, trx) {
        Some(victim) => Arc::ptr_eq(&victim, trx) || trx.was_chosen_as_victim(),
        None => trx.was_chosen_as_victim(),
    }
}
