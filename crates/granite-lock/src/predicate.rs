//! Predicate locks for spatial indexes.
//!
//! A predicate lock guards a minimum bounding rectangle on one page. All
//! predicate locks reside on the page infimum heap number; conflicts are
//! decided by rectangle intersection instead of record identity.

use crate::lock::{Lock, LockMode, TypeMode};
use crate::mode;
use crate::page::PageView;
use crate::queue;
use crate::sys::{HashKind, LockSys};
use crate::trx::Trx;
use crate::LockStatus;
use granite_common::prelude::*;
use std::sync::Arc;

/// Minimum bounding rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mbr {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

impl Mbr {
    pub fn new(xmin: f64, xmax: f64, ymin: f64, ymax: f64) -> Mbr {
        Mbr {
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }

    pub fn intersects(&self, other: &Mbr) -> bool {
        self.xmin <= other.xmax
            && other.xmin <= self.xmax
            && self.ymin <= other.ymax
            && other.ymin <= self.ymax
    }

    /// Grow this rectangle to cover `other`.
    pub fn union_with(&mut self, other: &Mbr) {
        self.xmin = self.xmin.min(other.xmin);
        self.xmax = self.xmax.max(other.xmax);
        self.ymin = self.ymin.min(other.ymin);
        self.ymax = self.ymax.max(other.ymax);
    }
}

/// Geometry-aware wait rule for predicate locks. The caller has already
/// ruled out same-transaction and mode-compatible pairs.
pub(crate) fn prdt_has_to_wait(lock1: &Lock, lock2: &Lock) -> bool {
    if !(lock2.type_mode.is_predicate() || lock2.type_mode.is_predicate_page()) {
        return false;
    }

    if lock2.type_mode.is_insert_intention() {
        // As with record gaps, nobody queues behind an insert intention.
        return false;
    }

    if lock1.type_mode.is_predicate_page() || lock2.type_mode.is_predicate_page() {
        // Page-level predicate locks conflict with everything on the page.
        return true;
    }

    match (&lock1.rec().prdt, &lock2.rec().prdt) {
        (Some(a), Some(b)) => a.intersects(b),
        _ => true,
    }
}

impl LockSys {
    /// Acquire a predicate lock covering `mbr` on `page`. If this
    /// transaction already holds one of the same mode there, its
    /// rectangle is enlarged instead of allocating a second lock.
    #[allow(clippy::too_many_arguments)]
    pub fn prdt_lock(
        &self,
        page: &PageView,
        mbr: Mbr,
        index: IndexId,
        table: TableId,
        mode_req: LockMode,
        trx: &Arc<Trx>,
    ) -> LockStatus {
        debug_assert!(matches!(mode_req, LockMode::Shared | LockMode::Exclusive));
        let type_mode = TypeMode::rec(mode_req).with(TypeMode::PREDICATE);
        let id = page.page_id();
        let mut heap = self.latch.lock();

        let chain = heap.locks_on_rec(HashKind::Prdt, id, HEAP_NO_INFIMUM);

        if let Some(own) = chain.iter().copied().find(|&l| {
            let lock = heap.arena.get(l);
            lock.trx.id == trx.id && lock.type_mode == type_mode
        }) {
            let prdt = &mut heap.arena.get_mut(own).rec_mut().prdt;
            match prdt {
                Some(existing) => existing.union_with(&mbr),
                None => *prdt = Some(mbr),
            }
            return LockStatus::Success;
        }

        let conflict = chain.into_iter().find(|&l| {
            let lock = heap.arena.get(l);
            lock.trx.id != trx.id
                && !mode::compatible(mode_req, lock.mode())
                && !lock.type_mode.is_insert_intention()
                && lock
                    .rec()
                    .prdt
                    .map(|other| other.intersects(&mbr))
                    .unwrap_or(true)
        });

        match conflict {
            Some(c_lock) => queue::enqueue_waiting(
                self,
                &mut heap,
                c_lock,
                type_mode,
                page,
                HEAP_NO_INFIMUM,
                index,
                table,
                trx,
                Some(mbr),
            ),
            None => {
                queue::create_rec_lock(
                    self,
                    &mut heap,
                    type_mode,
                    page,
                    HEAP_NO_INFIMUM,
                    index,
                    table,
                    trx,
                    None,
                    None,
                    Some(mbr),
                );
                LockStatus::SuccessLockedRec
            }
        }
    }

    /// Acquire a page-level predicate lock, blocking page reorganization
    /// against concurrent predicate readers.
    pub fn prdt_page_lock(
        &self,
        page: &PageView,
        index: IndexId,
        table: TableId,
        trx: &Arc<Trx>,
    ) -> LockStatus {
        let type_mode = TypeMode::rec(LockMode::Shared).with(TypeMode::PREDICATE_PAGE);
        let id = page.page_id();
        let mut heap = self.latch.lock();

        let already = heap
            .locks_on_rec(HashKind::PrdtPage, id, HEAP_NO_INFIMUM)
            .into_iter()
            .any(|l| heap.arena.get(l).trx.id == trx.id);
        if !already {
            queue::create_rec_lock(
                self,
                &mut heap,
                type_mode,
                page,
                HEAP_NO_INFIMUM,
                index,
                table,
                trx,
                None,
                None,
                None,
            );
            return LockStatus::SuccessLockedRec;
        }
        LockStatus::Success
    }

    /// Move predicate locks between spatial pages after records moved.
    /// `moves` pairs (donor heap number, receiver heap number).
    pub fn rtr_move_rec_list(
        &self,
        new_block: &PageView,
        block: &PageView,
        moves: &[(HeapNo, HeapNo)],
    ) {
        let mut heap = self.latch.lock();
        for &(donor_heap_no, receiver_heap_no) in moves {
            for l in heap.locks_on_rec(HashKind::Prdt, block.page_id(), donor_heap_no) {
                let (type_mode, index, table, trx, prdt) = {
                    let lock = heap.arena.get_mut(l);
                    lock.rec_mut().bitmap.reset(donor_heap_no);
                    let type_mode = lock.type_mode;
                    if type_mode.is_waiting() {
                        lock.type_mode = type_mode.without(TypeMode::WAIT);
                    }
                    let rec = lock.rec();
                    (type_mode, rec.index, rec.table, lock.trx.clone(), rec.prdt)
                };
                queue::create_rec_lock(
                    self,
                    &mut heap,
                    type_mode,
                    new_block,
                    receiver_heap_no,
                    index,
                    table,
                    &trx,
                    None,
                    None,
                    prdt,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbr_intersection() {
        let a = Mbr::new(0.0, 10.0, 0.0, 10.0);
        let b = Mbr::new(5.0, 15.0, 5.0, 15.0);
        let c = Mbr::new(11.0, 20.0, 0.0, 10.0);
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));

        let mut u = a;
        u.union_with(&c);
        assert!(u.intersects(&c));
        assert_eq!(u.xmax, 20.0);
    }
}
