//! Lock mode algebra: compatibility, strength, and the record-level
//! has-to-wait rules.

use crate::lock::{Lock, LockMode, TypeMode};
use crate::policy::PriorityPolicy;
use crate::predicate;
use crate::trx::Trx;
use granite_common::prelude::*;

/// Gap qualifier for a record lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapMode {
    /// Next-key lock: the record and the gap before it.
    Ordinary,
    /// Only the gap before the record.
    Gap,
    /// Only the record itself.
    RecNotGap,
}

impl GapMode {
    pub(crate) fn flags(self) -> u32 {
        match self {
            GapMode::Ordinary => 0,
            GapMode::Gap => TypeMode::GAP,
            GapMode::RecNotGap => TypeMode::REC_NOT_GAP,
        }
    }
}

/// Check if two lock modes can be held on the same resource by two
/// different transactions at the same time.
///
/// ```text
///          IS   IX   S    X    AI
///     IS   +    +    +    -    +
///     IX   +    +    -    -    +
///     S    +    -    +    -    -
///     X    -    -    -    -    -
///     AI   +    +    -    -    -
/// ```
pub fn compatible(a: LockMode, b: LockMode) -> bool {
    use LockMode::*;
    matches!(
        (a, b),
        (IntentionShared, IntentionShared)
            | (IntentionShared, IntentionExclusive)
            | (IntentionShared, Shared)
            | (IntentionShared, AutoInc)
            | (IntentionExclusive, IntentionShared)
            | (IntentionExclusive, IntentionExclusive)
            | (IntentionExclusive, AutoInc)
            | (Shared, IntentionShared)
            | (Shared, Shared)
            | (AutoInc, IntentionShared)
            | (AutoInc, IntentionExclusive)
    )
}

/// Check if holding `a` subsumes a request for `b`.
///
/// ```text
///          IS   IX   S    X    AI
///     IS   +    -    -    -    -
///     IX   +    +    -    -    -
///     S    +    -    +    -    -
///     X    +    +    +    +    +
///     AI   -    -    -    -    +
/// ```
pub fn stronger_or_equal(a: LockMode, b: LockMode) -> bool {
    use LockMode::*;
    matches!(
        (a, b),
        (IntentionShared, IntentionShared)
            | (IntentionExclusive, IntentionShared)
            | (IntentionExclusive, IntentionExclusive)
            | (Shared, IntentionShared)
            | (Shared, Shared)
            | (Exclusive, _)
            | (AutoInc, AutoInc)
    )
}

/// Check if a record lock request with `type_mode` by `trx` has to wait for
/// `lock2` to be removed. `lock2` is assumed to have a bit set on the same
/// record. `is_supremum` marks a request on the page supremum, which is
/// always a gap-type request.
pub(crate) fn rec_has_to_wait(
    policy: &dyn PriorityPolicy,
    trx: &Trx,
    type_mode: TypeMode,
    lock2: &Lock,
    is_supremum: bool,
) -> bool {
    debug_assert!(!lock2.is_table());

    if trx.id == lock2.trx.id || compatible(type_mode.mode(), lock2.mode()) {
        return false;
    }

    // The rules when gap type locks cause waits are somewhat involved.

    if (is_supremum || type_mode.is_gap()) && !type_mode.is_insert_intention() {
        // Gap type locks without the insert-intention flag never wait:
        // different transactions may hold conflicting lock modes on a gap.
        return false;
    }

    if !type_mode.is_insert_intention() && lock2.type_mode.is_gap() {
        // An ordinary or REC_NOT_GAP request does not wait for a gap lock.
        return false;
    }

    if type_mode.is_gap() && lock2.type_mode.is_record_not_gap() {
        // A gap request does not wait for a REC_NOT_GAP lock.
        return false;
    }

    if lock2.type_mode.is_insert_intention() {
        // No request waits for an insert-intention lock to be removed.
        // Insert intentions do not disturb each other, and making a
        // next-key waiter block behind one would manufacture deadlocks
        // between pairs of inserting transactions.
        return false;
    }

    if (type_mode.is_gap() || lock2.type_mode.is_gap())
        && policy.order_before(trx, &lock2.trx)
    {
        // The upper layer has already fixed the commit order between the
        // requester and the holder, so the gap conflict cannot reorder
        // them; skipping the wait saves a rollback.
        return false;
    }

    true
}

/// Check if a waiting lock `lock1` still has to wait for `lock2`.
/// For record locks, `lock2` is assumed to have a bit set on the same
/// record as `lock1`.
pub(crate) fn has_to_wait(policy: &dyn PriorityPolicy, lock1: &Lock, lock2: &Lock) -> bool {
    if lock1.trx.id == lock2.trx.id || compatible(lock1.mode(), lock2.mode()) {
        return false;
    }

    if lock1.is_table() {
        return true;
    }
    debug_assert!(!lock2.is_table());

    if lock1.type_mode.is_predicate() || lock1.type_mode.is_predicate_page() {
        return predicate::prdt_has_to_wait(lock1, lock2);
    }

    let supremum = lock1.rec().bitmap.get(HEAP_NO_SUPREMUM);
    rec_has_to_wait(policy, &lock1.trx, lock1.type_mode, lock2, supremum)
}
