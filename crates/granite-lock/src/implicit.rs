//! The implicit-lock bridge, and the record-level check-and-lock entry
//! points that consult it.
//!
//! A transaction that modified a record holds an exclusive claim on it
//! without any lock structure: the claim is inferred from the record's
//! last-modifier id (clustered index) or the undo chain (secondary
//! index). On the first observed conflict the holder is promoted to an
//! explicit `X | REC_NOT_GAP` lock, and the conflicting transaction then
//! enters the normal queue.

use crate::lock::{LockMode, TypeMode};
use crate::mode::GapMode;
use crate::page::PageView;
use crate::queue;
use crate::trx::{Trx, TrxState};
use crate::{LockStatus, LockSys};
use granite_common::prelude::*;
use std::sync::Arc;

/// MVCC's view of implicit record locks. Supplied by the transaction /
/// undo subsystem.
pub trait MvccReader: Send + Sync {
    /// The last modifier of a clustered index record, read from the
    /// record's transaction-id field. Returns `None` when no active
    /// transaction can hold an implicit lock on it.
    fn clust_implicit_holder(
        &self,
        index: IndexId,
        page_id: PageId,
        heap_no: HeapNo,
    ) -> Option<TrxId>;

    /// The implicit holder of a secondary index record, found by walking
    /// the undo chain of the corresponding clustered record.
    fn sec_implicit_holder(&self, index: IndexId, page_id: PageId, heap_no: HeapNo)
        -> Option<TrxId>;
}

/// An MVCC view with no implicit locks; useful for secondary-index-only
/// call sites and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoImplicitLocks;

impl MvccReader for NoImplicitLocks {
    fn clust_implicit_holder(&self, _: IndexId, _: PageId, _: HeapNo) -> Option<TrxId> {
        None
    }

    fn sec_implicit_holder(&self, _: IndexId, _: PageId, _: HeapNo) -> Option<TrxId> {
        None
    }
}

impl LockSys {
    /// Create an explicit `X | REC_NOT_GAP` lock on behalf of `holder`,
    /// which holds an implicit lock on (`page`, `heap_no`). The holder is
    /// pinned by the `Arc`, so it cannot be destroyed mid-conversion; a
    /// holder that already committed in memory is left alone.
    fn convert_impl_to_expl_for_trx(
        &self,
        page: &PageView,
        heap_no: HeapNo,
        index: IndexId,
        table: TableId,
        holder: &Arc<Trx>,
    ) {
        let mut heap = self.latch.lock();
        let precise = TypeMode::rec(LockMode::Exclusive).with(TypeMode::REC_NOT_GAP);
        if holder.state() != TrxState::Committed
            && queue::has_expl(&heap, precise, page.page_id(), heap_no, holder.id).is_none()
        {
            queue::add_to_queue(
                self, &mut heap, precise, page, heap_no, index, table, holder,
            );
        }
    }

    /// If an implicit x-lock exists on (`page`, `heap_no`), convert it to
    /// an explicit one. Returns whether `caller_trx` itself already holds
    /// the implicit lock.
    #[allow(clippy::too_many_arguments)]
    fn convert_impl_to_expl(
        &self,
        caller_trx: &Arc<Trx>,
        page: &PageView,
        heap_no: HeapNo,
        index: IndexId,
        table: TableId,
        clustered: bool,
        mvcc: &dyn MvccReader,
    ) -> bool {
        let holder_id = if clustered {
            let Some(trx_id) = mvcc.clust_implicit_holder(index, page.page_id(), heap_no) else {
                return false;
            };
            // Sanity check: a modifier id from the future means the record
            // is corrupted. Treat the page as having no implicit holder.
            if trx_id >= self.trxs.max_trx_id() {
                error!(
                    %trx_id, page = %page.page_id(), heap_no,
                    "record modifier id is ahead of the id allocator; page corrupted"
                );
                return false;
            }
            trx_id
        } else {
            match mvcc.sec_implicit_holder(index, page.page_id(), heap_no) {
                Some(trx_id) => trx_id,
                None => return false,
            }
        };

        if holder_id == caller_trx.id {
            // We already hold the implicit lock ourselves.
            return true;
        }

        if let Some(holder) = self.trxs.find(holder_id) {
            self.convert_impl_to_expl_for_trx(page, heap_no, index, table, &holder);
        }
        false
    }

    /// Check for conflicts before modifying a clustered index record.
    pub fn clust_rec_modify_check_and_lock(
        &self,
        page: &PageView,
        heap_no: HeapNo,
        index: IndexId,
        table: TableId,
        trx: &Arc<Trx>,
        mvcc: &dyn MvccReader,
    ) -> LockStatus {
        debug_assert_ne!(heap_no, HEAP_NO_SUPREMUM);

        // If a transaction has no explicit x-lock set on the record, set
        // one for it.
        if self.convert_impl_to_expl(trx, page, heap_no, index, table, true, mvcc) {
            // We already hold an implicit exclusive lock.
            return LockStatus::Success;
        }

        let mode = TypeMode::rec(LockMode::Exclusive).with(TypeMode::REC_NOT_GAP);
        queue::lock_rec(self, true, mode, page, heap_no, index, table, trx).collapse_locked_rec()
    }

    /// Check for conflicts before delete-marking a secondary index
    /// record. No other transaction can hold an implicit lock here: the
    /// clustered record was modified first.
    pub fn sec_rec_modify_check_and_lock(
        &self,
        page: &PageView,
        heap_no: HeapNo,
        index: IndexId,
        table: TableId,
        trx: &Arc<Trx>,
    ) -> LockStatus {
        debug_assert_ne!(heap_no, HEAP_NO_SUPREMUM);
        let mode = TypeMode::rec(LockMode::Exclusive).with(TypeMode::REC_NOT_GAP);
        queue::lock_rec(self, true, mode, page, heap_no, index, table, trx).collapse_locked_rec()
    }

    /// Lock a clustered index record (or the supremum) for a locking
    /// read in the given mode and gap qualifier.
    #[allow(clippy::too_many_arguments)]
    pub fn clust_rec_read_check_and_lock(
        &self,
        page: &PageView,
        heap_no: HeapNo,
        index: IndexId,
        table: TableId,
        mode_req: LockMode,
        gap: GapMode,
        trx: &Arc<Trx>,
        mvcc: &dyn MvccReader,
    ) -> LockStatus {
        debug_assert!(matches!(mode_req, LockMode::Shared | LockMode::Exclusive));

        if heap_no != HEAP_NO_SUPREMUM
            && self.convert_impl_to_expl(trx, page, heap_no, index, table, true, mvcc)
        {
            // We already hold an implicit exclusive lock.
            return LockStatus::Success;
        }

        let mode_full = TypeMode::rec(mode_req).with(gap.flags());
        queue::lock_rec(self, false, mode_full, page, heap_no, index, table, trx)
    }

    /// [`Self::clust_rec_read_check_and_lock`] without the distinction
    /// between `Success` and `SuccessLockedRec`.
    #[allow(clippy::too_many_arguments)]
    pub fn clust_rec_read_check_and_lock_alt(
        &self,
        page: &PageView,
        heap_no: HeapNo,
        index: IndexId,
        table: TableId,
        mode_req: LockMode,
        gap: GapMode,
        trx: &Arc<Trx>,
        mvcc: &dyn MvccReader,
    ) -> LockStatus {
        self.clust_rec_read_check_and_lock(page, heap_no, index, table, mode_req, gap, trx, mvcc)
            .collapse_locked_rec()
    }

    /// Lock a secondary index record (or the supremum) for a locking
    /// read. `page_max_trx_id` is the page header's max-modifier stamp:
    /// when it predates every active transaction, no implicit lock can
    /// exist and the undo-chain walk is skipped.
    #[allow(clippy::too_many_arguments)]
    pub fn sec_rec_read_check_and_lock(
        &self,
        page: &PageView,
        heap_no: HeapNo,
        index: IndexId,
        table: TableId,
        mode_req: LockMode,
        gap: GapMode,
        trx: &Arc<Trx>,
        mvcc: &dyn MvccReader,
        page_max_trx_id: Option<TrxId>,
    ) -> LockStatus {
        debug_assert!(matches!(mode_req, LockMode::Shared | LockMode::Exclusive));

        let may_have_implicit = heap_no != HEAP_NO_SUPREMUM
            && page_max_trx_id
                .map(|max| self.trxs.min_active_id().map_or(true, |min| max >= min))
                .unwrap_or(true);

        if may_have_implicit
            && self.convert_impl_to_expl(trx, page, heap_no, index, table, false, mvcc)
        {
            return LockStatus::Success;
        }

        let mode_full = TypeMode::rec(mode_req).with(gap.flags());
        queue::lock_rec(self, false, mode_full, page, heap_no, index, table, trx)
    }
}
