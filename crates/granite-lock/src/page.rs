//! Page geometry snapshots supplied by the B-tree.
//!
//! The lock manager never touches page frames. Callers hand it a
//! [`PageView`]: the page identifier plus the heap numbers of the user
//! records in key order. The infimum (heap 0) and supremum (heap 1)
//! sentinels are implicit.

use granite_common::prelude::*;

#[derive(Debug, Clone)]
pub struct PageView {
    page_id: PageId,
    /// User records in key order, as heap numbers (each >= 2).
    records: Vec<HeapNo>,
}

impl PageView {
    pub fn new(page_id: PageId, records: Vec<HeapNo>) -> PageView {
        debug_assert!(records.iter().all(|&h| h >= HEAP_NO_USER_LOW));
        PageView { page_id, records }
    }

    /// A page with no user records.
    pub fn empty(page_id: PageId) -> PageView {
        PageView {
            page_id,
            records: Vec::new(),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// User records in key order.
    pub fn records(&self) -> &[HeapNo] {
        &self.records
    }

    /// Heap number of the first user record, or the supremum if the page
    /// holds none.
    pub fn min_user_heap_no(&self) -> HeapNo {
        self.records.first().copied().unwrap_or(HEAP_NO_SUPREMUM)
    }

    /// Successor of `heap_no` in key order. The successor of the last user
    /// record (and of the supremum itself) is the supremum; the successor
    /// of the infimum is the first user record.
    pub fn next_heap_no(&self, heap_no: HeapNo) -> HeapNo {
        if heap_no == HEAP_NO_INFIMUM {
            return self.min_user_heap_no();
        }
        if heap_no == HEAP_NO_SUPREMUM {
            return HEAP_NO_SUPREMUM;
        }
        match self.records.iter().position(|&h| h == heap_no) {
            Some(pos) => self
                .records
                .get(pos + 1)
                .copied()
                .unwrap_or(HEAP_NO_SUPREMUM),
            None => HEAP_NO_SUPREMUM,
        }
    }

    /// Every heap number on the page in order: infimum, user records,
    /// supremum.
    pub fn all_heap_nos(&self) -> impl Iterator<Item = HeapNo> + '_ {
        std::iter::once(HEAP_NO_INFIMUM)
            .chain(self.records.iter().copied())
            .chain(std::iter::once(HEAP_NO_SUPREMUM))
    }

    /// Number of heap slots in use on the page, counting the sentinels.
    /// Lock bitmaps are sized from this at allocation time.
    pub fn heap_count(&self) -> usize {
        self.records
            .iter()
            .max()
            .map(|&h| h + 1)
            .unwrap_or(HEAP_NO_USER_LOW)
    }

    pub fn contains(&self, heap_no: HeapNo) -> bool {
        self.records.contains(&heap_no)
    }
}
