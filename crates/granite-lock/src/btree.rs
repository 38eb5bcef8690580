//! Lock migration under B-tree restructuring: splits, merges, inserts,
//! deletes, reorganization, and page discard.
//!
//! Every hook takes the lock-system latch once and rewrites bitmaps
//! atomically. No lock is lost across a hook: it either moves, is
//! inherited as a gap lock, or is released with its waiters woken.

use crate::lock::{LockMode, TypeMode};
use crate::page::PageView;
use crate::queue;
use crate::sys::{HashKind, LockHeap, LockSys};
use crate::table;
use granite_common::prelude::*;

/// Make the record (`heir_block`, `heir_heap_no`) inherit the locks of
/// (`donor`, `heap_no`) as gap type locks. Insert intentions are not
/// inherited, and neither are record-only X locks taken by UPDATE/DELETE
/// under READ COMMITTED or weaker: those must not grow into gap locks.
/// Waiting lock requests are inherited as granted gap locks. Lock bits on
/// the donor are not reset here.
pub(crate) fn inherit_to_gap(
    sys: &LockSys,
    heap: &mut LockHeap,
    heir_block: &PageView,
    donor: PageId,
    heir_heap_no: HeapNo,
    heap_no: HeapNo,
) {
    for l in heap.locks_on_rec(HashKind::Rec, donor, heap_no) {
        let (type_mode, index, table, trx) = {
            let lock = heap.arena.get(l);
            let rec = lock.rec();
            (lock.type_mode, rec.index, rec.table, lock.trx.clone())
        };
        if !type_mode.is_insert_intention()
            && (trx.isolation > IsolationLevel::ReadCommitted
                || type_mode.mode() != LockMode::Exclusive)
        {
            queue::add_to_queue(
                sys,
                heap,
                TypeMode::rec(type_mode.mode()).with(TypeMode::GAP),
                heir_block,
                heir_heap_no,
                index,
                table,
                &trx,
            );
        }
    }
}

/// Make the record (`block`, `heir_heap_no`) inherit the gap-type locks
/// of (`block`, `heap_no`). Skips insert intentions and holders that
/// already own a full-table X lock.
pub(crate) fn inherit_to_gap_if_gap_lock(
    sys: &LockSys,
    heap: &mut LockHeap,
    block: &PageView,
    heir_heap_no: HeapNo,
    heap_no: HeapNo,
) {
    let id = block.page_id();
    for l in heap.locks_on_rec(HashKind::Rec, id, heap_no) {
        let (type_mode, index, table, trx) = {
            let lock = heap.arena.get(l);
            let rec = lock.rec();
            (lock.type_mode, rec.index, rec.table, lock.trx.clone())
        };
        if !type_mode.is_insert_intention()
            && (heap_no == HEAP_NO_SUPREMUM || !type_mode.is_record_not_gap())
            && !table::table_has(heap, trx.id, table, LockMode::Exclusive)
        {
            queue::add_to_queue(
                sys,
                heap,
                TypeMode::rec(type_mode.mode()).with(TypeMode::GAP),
                block,
                heir_heap_no,
                index,
                table,
                &trx,
            );
        }
    }
}

/// Move the locks of one record to another record, resetting the bits on
/// the donor. A moved waiting request is re-homed onto the new lock
/// object, which becomes the transaction's wait lock.
pub(crate) fn rec_move(
    sys: &LockSys,
    heap: &mut LockHeap,
    receiver: &PageView,
    donator: PageId,
    receiver_heap_no: HeapNo,
    donator_heap_no: HeapNo,
) {
    for l in heap.locks_on_rec(HashKind::Rec, donator, donator_heap_no) {
        let (type_mode, index, table, trx) = {
            let lock = heap.arena.get_mut(l);
            lock.rec_mut().bitmap.reset(donator_heap_no);
            let type_mode = lock.type_mode;
            if type_mode.is_waiting() {
                // The new lock object will carry the wait.
                lock.type_mode = type_mode.without(TypeMode::WAIT);
            }
            let rec = lock.rec();
            (type_mode, rec.index, rec.table, lock.trx.clone())
        };
        // The bit is reset first, so the move also works when donator and
        // receiver are the same page.
        queue::add_to_queue(
            sys,
            heap,
            type_mode,
            receiver,
            receiver_heap_no,
            index,
            table,
            &trx,
        );
    }
}

/// Free every lock on a discarded page in one hash table. Bitmaps must
/// already be empty and waiters released.
fn free_all_from_discard_page_low(sys: &LockSys, heap: &mut LockHeap, kind: HashKind, id: PageId) {
    for l in heap.page_chain(kind, id) {
        debug_assert!(heap.arena.get(l).rec().bitmap.is_empty());
        debug_assert!(!heap.arena.get(l).is_waiting());
        queue::rec_discard(sys, heap, l);
    }
}

/// Free every lock on a discarded page, in all three hash tables.
pub(crate) fn free_all_from_discard_page(sys: &LockSys, heap: &mut LockHeap, id: PageId) {
    free_all_from_discard_page_low(sys, heap, HashKind::Rec, id);
    free_all_from_discard_page_low(sys, heap, HashKind::Prdt, id);
    free_all_from_discard_page_low(sys, heap, HashKind::PrdtPage, id);
}

impl LockSys {
    /// A page was split to the right: `right` is the new page holding the
    /// end of `left`'s record list.
    pub fn update_split_right(&self, right: &PageView, left: &PageView) {
        let heir_heap_no = right.min_user_heap_no();
        let mut heap = self.latch.lock();

        // Move the locks on the supremum of the left page to the supremum
        // of the right page.
        rec_move(
            self,
            &mut heap,
            right,
            left.page_id(),
            HEAP_NO_SUPREMUM,
            HEAP_NO_SUPREMUM,
        );

        // Inherit to the supremum of the left page the locks of the
        // successor of the infimum on the right page, so the gap the
        // split cut in two stays covered on both sides.
        inherit_to_gap(
            self,
            &mut heap,
            left,
            right.page_id(),
            HEAP_NO_SUPREMUM,
            heir_heap_no,
        );
    }

    /// A page was split to the left.
    pub fn update_split_left(&self, right: &PageView, left: &PageView) {
        let heap_no = right.min_user_heap_no();
        let mut heap = self.latch.lock();
        inherit_to_gap(
            self,
            &mut heap,
            left,
            right.page_id(),
            HEAP_NO_SUPREMUM,
            heap_no,
        );
    }

    /// `left` was merged into `right` and will be discarded. `orig_succ`
    /// is the original successor of the infimum on the right page before
    /// the merge.
    pub fn update_merge_right(&self, right: &PageView, orig_succ: HeapNo, left: &PageView) {
        let l = left.page_id();
        let mut heap = self.latch.lock();

        // Inherit the locks from the supremum of the left page to the
        // original successor of infimum on the right page.
        inherit_to_gap(self, &mut heap, right, l, orig_succ, HEAP_NO_SUPREMUM);

        // Reset the locks on the supremum of the left page, releasing
        // waiting transactions.
        queue::reset_and_release_wait_low(self, &mut heap, HashKind::Rec, l, HEAP_NO_SUPREMUM);

        free_all_from_discard_page(self, &mut heap, l);
    }

    /// `right` was merged into `left` and will be discarded. `orig_pred`
    /// is the original predecessor of the supremum on the left page
    /// before the merge.
    pub fn update_merge_left(&self, left: &PageView, orig_pred: HeapNo, right: PageId) {
        let l = left.page_id();
        let mut heap = self.latch.lock();

        let left_next_rec = left.next_heap_no(orig_pred);
        if left_next_rec != HEAP_NO_SUPREMUM {
            // Inherit the locks on the supremum of the left page to the
            // first record which was moved from the right page.
            inherit_to_gap(self, &mut heap, left, l, left_next_rec, HEAP_NO_SUPREMUM);
            queue::reset_and_release_wait_low(self, &mut heap, HashKind::Rec, l, HEAP_NO_SUPREMUM);
        }

        // Move the locks from the supremum of the right page to the
        // supremum of the left page.
        rec_move(self, &mut heap, left, right, HEAP_NO_SUPREMUM, HEAP_NO_SUPREMUM);

        free_all_from_discard_page(self, &mut heap, right);
    }

    /// A page was split and then the result merged back: inherit across
    /// both boundaries in one critical section.
    pub fn update_split_and_merge(&self, left: &PageView, orig_pred: HeapNo, right: &PageView) {
        let l = left.page_id();
        let mut heap = self.latch.lock();

        let left_next_rec = left.next_heap_no(orig_pred);

        // Inherit the locks on the supremum of the left page to the first
        // record moved over from the right page.
        inherit_to_gap(self, &mut heap, left, l, left_next_rec, HEAP_NO_SUPREMUM);

        queue::reset_and_release_wait_low(self, &mut heap, HashKind::Rec, l, HEAP_NO_SUPREMUM);

        // Inherit to the supremum of the left page from the successor of
        // the infimum on the right page.
        inherit_to_gap(
            self,
            &mut heap,
            left,
            right.page_id(),
            HEAP_NO_SUPREMUM,
            right.min_user_heap_no(),
        );
    }

    /// The root page was copied to `block` when the tree was raised. Lock
    /// structs stay on the root: in a pessimistic update its infimum acts
    /// as a dummy carrier for the locks of the record being updated.
    pub fn update_root_raise(&self, block: &PageView, root: PageId) {
        let mut heap = self.latch.lock();
        rec_move(
            self,
            &mut heap,
            block,
            root,
            HEAP_NO_SUPREMUM,
            HEAP_NO_SUPREMUM,
        );
    }

    /// A page was copied to `new_block` and the old page is discarded.
    pub fn update_copy_and_discard(&self, new_block: &PageView, old: PageId) {
        let mut heap = self.latch.lock();
        rec_move(
            self,
            &mut heap,
            new_block,
            old,
            HEAP_NO_SUPREMUM,
            HEAP_NO_SUPREMUM,
        );
        free_all_from_discard_page(self, &mut heap, old);
    }

    /// Reset the locks on (`heir_block`, `heir_heap_no`) and replace them
    /// with gap locks inherited from (`donor`, `heap_no`).
    pub fn rec_reset_and_inherit_gap_locks(
        &self,
        heir_block: &PageView,
        donor: PageId,
        heir_heap_no: HeapNo,
        heap_no: HeapNo,
    ) {
        let mut heap = self.latch.lock();
        queue::reset_and_release_wait(self, &mut heap, heir_block.page_id(), heir_heap_no);
        inherit_to_gap(self, &mut heap, heir_block, donor, heir_heap_no, heap_no);
    }

    /// `block` is being discarded. Every record's locks are inherited as
    /// gap locks on the heir record, then all locks on the page are freed
    /// en masse. The only hook that releases locks.
    pub fn update_discard(&self, heir_block: &PageView, heir_heap_no: HeapNo, block: &PageView) {
        let page_id = block.page_id();
        let mut heap = self.latch.lock();

        if heap.first_lock_on_page(HashKind::Rec, page_id).is_some() {
            for heap_no in block.all_heap_nos().collect::<Vec<_>>() {
                inherit_to_gap(self, &mut heap, heir_block, page_id, heir_heap_no, heap_no);
                queue::reset_and_release_wait(self, &mut heap, page_id, heap_no);
            }
            free_all_from_discard_page_low(self, &mut heap, HashKind::Rec, page_id);
        } else {
            free_all_from_discard_page_low(self, &mut heap, HashKind::Prdt, page_id);
            free_all_from_discard_page_low(self, &mut heap, HashKind::PrdtPage, page_id);
        }
    }

    /// A new record was inserted at (`block`, `rec`): it inherits
    /// gap-type copies of the locks held on its successor.
    pub fn update_insert(&self, block: &PageView, rec: HeapNo) {
        let donator = block.next_heap_no(rec);
        let mut heap = self.latch.lock();
        inherit_to_gap_if_gap_lock(self, &mut heap, block, rec, donator);
    }

    /// The record (`block`, `rec`) is being removed: its locks transfer
    /// to the successor in gap mode, then its bits are reset and waiters
    /// on it re-granted.
    pub fn update_delete(&self, block: &PageView, rec: HeapNo) {
        let next = block.next_heap_no(rec);
        let id = block.page_id();
        let mut heap = self.latch.lock();

        // Let the next record inherit the locks from rec, in gap mode.
        inherit_to_gap(self, &mut heap, block, id, next, rec);

        // Reset the lock bits on rec and release waiting transactions.
        queue::reset_and_release_wait(self, &mut heap, id, rec);
    }

    /// Park the locks of (`block`, `rec`) on the page infimum while the
    /// physical record moves during a size-changing update. The infimum
    /// acts as a dummy carrier so that lock releases keep working.
    pub fn store_on_page_infimum(&self, block: &PageView, rec: HeapNo) {
        let mut heap = self.latch.lock();
        rec_move(
            self,
            &mut heap,
            block,
            block.page_id(),
            HEAP_NO_INFIMUM,
            rec,
        );
    }

    /// Restore locks parked on the infimum of `donator` to the record's
    /// new position (`block`, `rec`).
    pub fn restore_from_page_infimum(&self, block: &PageView, rec: HeapNo, donator: PageId) {
        let mut heap = self.latch.lock();
        rec_move(self, &mut heap, block, donator, rec, HEAP_NO_INFIMUM);
    }

    /// A page was reorganized: records kept their order but changed heap
    /// numbers. `block` is the reorganized image, `oblock` the old one;
    /// each lock is re-projected onto the new image by matching records
    /// positionally, infimum and supremum included (the infimum may carry
    /// parked locks).
    pub fn move_reorganize_page(&self, block: &PageView, oblock: &PageView) {
        struct OldLock {
            type_mode: TypeMode,
            index: IndexId,
            table: TableId,
            trx: std::sync::Arc<crate::trx::Trx>,
            bitmap: crate::lock::Bitmap,
        }

        let id = block.page_id();
        let mut heap = self.latch.lock();

        let chain = heap.page_chain(HashKind::Rec, id);
        if chain.is_empty() {
            return;
        }

        // Copy the locks on the page and reset the originals' bitmaps.
        let mut old_locks = Vec::with_capacity(chain.len());
        for l in chain {
            let lock = heap.arena.get_mut(l);
            let rec = lock.rec();
            old_locks.push(OldLock {
                type_mode: lock.type_mode,
                index: rec.index,
                table: rec.table,
                trx: lock.trx.clone(),
                bitmap: rec.bitmap.clone(),
            });
            lock.rec_mut().bitmap.clear_all();
            if lock.type_mode.is_waiting() {
                lock.type_mode = lock.type_mode.without(TypeMode::WAIT);
            }
        }

        // Re-project granted locks first so a waiter cannot end up ahead
        // of the lock it waits for.
        old_locks.sort_by_key(|l| l.type_mode.is_waiting());

        for old in &old_locks {
            for (new_heap_no, old_heap_no) in block.all_heap_nos().zip(oblock.all_heap_nos()) {
                // The old bitmap may be too small for the new heap
                // number; out-of-range bits read as unset.
                if old.bitmap.get(old_heap_no) {
                    queue::add_to_queue(
                        self,
                        &mut heap,
                        old.type_mode,
                        block,
                        new_heap_no,
                        old.index,
                        old.table,
                        &old.trx,
                    );
                }
            }
        }
    }

    /// The end of `block`'s record list, starting at `first_moved`, was
    /// moved to the start of `new_block`. Waiting requests and granted
    /// gap locks behind them are re-enqueued in their original order.
    pub fn move_rec_list_end(&self, new_block: &PageView, block: &PageView, first_moved: HeapNo) {
        let start = block
            .records()
            .iter()
            .position(|&h| h == first_moved)
            .unwrap_or(block.records().len());
        let donor_recs: Vec<HeapNo> = block.records()[start..].to_vec();

        let mut heap = self.latch.lock();
        for l in heap.page_chain(HashKind::Rec, block.page_id()) {
            for (pos, &donor_heap_no) in donor_recs.iter().enumerate() {
                let Some(&receiver_heap_no) = new_block.records().get(pos) else {
                    break;
                };
                let moved = {
                    let lock = heap.arena.get_mut(l);
                    lock.rec_mut().bitmap.reset(donor_heap_no)
                };
                if moved {
                    let (type_mode, index, table, trx) = {
                        let lock = heap.arena.get_mut(l);
                        let type_mode = lock.type_mode;
                        if type_mode.is_waiting() {
                            lock.type_mode = type_mode.without(TypeMode::WAIT);
                        }
                        let rec = lock.rec();
                        (type_mode, rec.index, rec.table, lock.trx.clone())
                    };
                    queue::add_to_queue(
                        self,
                        &mut heap,
                        type_mode,
                        new_block,
                        receiver_heap_no,
                        index,
                        table,
                        &trx,
                    );
                }
            }
        }
    }

    /// The start of `block`'s record list, up to but not including
    /// `first_not_moved`, was appended to `new_block` beginning at
    /// `receiver_start`.
    pub fn move_rec_list_start(
        &self,
        new_block: &PageView,
        block: &PageView,
        first_not_moved: HeapNo,
        receiver_start: HeapNo,
    ) {
        let donor_recs: Vec<HeapNo> = block
            .records()
            .iter()
            .copied()
            .take_while(|&h| h != first_not_moved)
            .collect();
        let receiver_pos = new_block
            .records()
            .iter()
            .position(|&h| h == receiver_start)
            .unwrap_or(new_block.records().len());
        let receiver_recs: Vec<HeapNo> = new_block.records()[receiver_pos..].to_vec();

        let mut heap = self.latch.lock();
        for l in heap.page_chain(HashKind::Rec, block.page_id()) {
            for (&donor_heap_no, &receiver_heap_no) in donor_recs.iter().zip(receiver_recs.iter())
            {
                let moved = {
                    let lock = heap.arena.get_mut(l);
                    lock.rec_mut().bitmap.reset(donor_heap_no)
                };
                if moved {
                    let (type_mode, index, table, trx) = {
                        let lock = heap.arena.get_mut(l);
                        let type_mode = lock.type_mode;
                        if type_mode.is_waiting() {
                            lock.type_mode = type_mode.without(TypeMode::WAIT);
                        }
                        let rec = lock.rec();
                        (type_mode, rec.index, rec.table, lock.trx.clone())
                    };
                    queue::add_to_queue(
                        self,
                        &mut heap,
                        type_mode,
                        new_block,
                        receiver_heap_no,
                        index,
                        table,
                        &trx,
                    );
                }
            }
        }
    }
}
