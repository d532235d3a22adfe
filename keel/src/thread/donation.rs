//! Priority donation.
//!
//! A thread blocked on a lock donates its effective priority to the lock's
//! holder, and through the holder to whoever the holder is blocked on. The
//! donation graph is never stored explicitly: a thread records the lock it
//! waits for (`lock_waiting`) and the table records the holder of every held
//! lock. Walking `lock_waiting -> holder -> lock_waiting -> ...` recovers the
//! chain.
//!
//! Effective priorities are recomputed from scratch instead of being patched:
//! [`propagate`] walks at most [`DONATION_DEPTH`] holders, computes the new
//! value of each against an overlay of values already recomputed in this
//! walk, and returns the result for the caller to apply in one step.

use super::{DONATION_DEPTH, LockId, Tid, scheduler::ThreadTable};
use std::collections::BTreeMap;

/// Threads that donate directly to `tid`: everyone blocked on a lock that
/// `tid` holds.
fn donors(table: &ThreadTable, tid: Tid) -> impl Iterator<Item = Tid> + '_ {
    table.threads.values().filter_map(move |th| {
        let lock = th.lock_waiting?;
        (table.lock_holders.get(&lock) == Some(&tid)).then_some(th.tid)
    })
}

fn effective_of(table: &ThreadTable, tid: Tid, overlay: &BTreeMap<Tid, i32>) -> i32 {
    let base = table.get(tid).priority;
    donors(table, tid)
        .map(|donor| {
            overlay
                .get(&donor)
                .copied()
                .unwrap_or_else(|| table.get(donor).effective)
        })
        .fold(base, i32::max)
}

/// The holder of the lock `tid` is blocked on, if any.
fn blocked_on(table: &ThreadTable, tid: Tid) -> Option<Tid> {
    let lock: LockId = table.get(tid).lock_waiting?;
    table.lock_holders.get(&lock).copied()
}

/// Recomputes the effective priority of `from` and of the holders it
/// transitively waits for, up to [`DONATION_DEPTH`] threads.
///
/// Nothing is modified; the new values are returned in walk order.
pub(crate) fn propagate(table: &ThreadTable, from: Tid) -> Vec<(Tid, i32)> {
    let mut overlay = BTreeMap::new();
    let mut order = Vec::new();
    let mut next = Some(from);
    for _ in 0..DONATION_DEPTH {
        let Some(tid) = next else {
            break;
        };
        if overlay.contains_key(&tid) {
            // Locks never form cycles, but don't loop if they somehow do.
            break;
        }
        let priority = effective_of(table, tid, &overlay);
        overlay.insert(tid, priority);
        order.push((tid, priority));
        next = blocked_on(table, tid);
    }
    order
}
