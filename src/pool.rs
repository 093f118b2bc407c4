//! Pending-pool bookkeeping: the per-class free list and the per-slot
//! priority wait lists.
//!
//! Every operation here mutates shared memory and therefore runs under
//! the store lock. Entries are linked by stored `i32` indices; an entry
//! sits either on the class free list (via `next`) or on exactly one
//! slot's wait list (via `prev`/`next`), never both. Wait lists are kept
//! priority-descending with FIFO order among equal priorities.
//!
//! Walks are bounded by the pool size so a torn link left by a crashed
//! writer cannot loop the caller; the dead-owner sweep reclaims the
//! entries themselves.

use crate::layout::{ClassSection, MAX_PENDING, NONE_INDEX};

fn index(stored: i32) -> Option<usize> {
    (0..MAX_PENDING as i32).contains(&stored).then_some(stored as usize)
}

/// Pop an entry off the class free list and mark it in use.
///
/// The entry comes back with cleared links and a reset notify cell;
/// `None` means all `MAX_PENDING` entries are queued.
pub(crate) fn acquire(section: &ClassSection) -> Option<usize> {
    let idx = index(section.free_head())?;
    let entry = section.entry(idx);
    section.set_free_head(entry.next());
    entry.set_next(NONE_INDEX);
    entry.set_prev(NONE_INDEX);
    entry.set_target_slot(NONE_INDEX);
    entry.notify().reset();
    entry.set_in_use(true);
    Some(idx)
}

/// Return an entry to the free list.
///
/// The record is cleared and pushed as the new free-list head; the caller
/// must have unlinked it from any wait list first. An entry that is not
/// in use already sits on the free list and is left there: pushing it
/// again would chain the list onto itself.
pub(crate) fn release(section: &ClassSection, idx: usize) {
    let entry = section.entry(idx);
    if !entry.in_use() {
        tracing::warn!(entry = idx, "ignoring release of an already free entry");
        return;
    }
    entry.reset();
    entry.set_next(section.free_head());
    section.set_free_head(idx as i32);
}

/// Link a prepared entry into its target slot's wait list.
///
/// The entry goes before the first entry whose priority is strictly
/// lower, so equal priorities keep arrival order regardless of the
/// tie-break policy.
pub(crate) fn insert_by_priority(section: &ClassSection, slot_idx: usize, entry_idx: usize) {
    let entry = section.entry(entry_idx);
    let priority = entry.priority();
    entry.set_target_slot(slot_idx as i32);

    let slot = section.slot(slot_idx);
    let mut prev = NONE_INDEX;
    let mut cur = slot.pending_head();
    let mut steps = 0;
    while let Some(c) = index(cur) {
        if section.entry(c).priority() < priority {
            break;
        }
        prev = cur;
        cur = section.entry(c).next();
        steps += 1;
        if steps > MAX_PENDING {
            tracing::warn!(slot = slot_idx, "wait list walk exceeded pool size, truncating");
            cur = NONE_INDEX;
            break;
        }
    }

    entry.set_prev(prev);
    entry.set_next(cur);
    match index(prev) {
        Some(p) => section.entry(p).set_next(entry_idx as i32),
        None => slot.set_pending_head(entry_idx as i32),
    }
    if let Some(c) = index(cur) {
        section.entry(c).set_prev(entry_idx as i32);
    }
}

/// Unlink an entry from a slot's wait list, leaving its payload intact.
pub(crate) fn unlink(section: &ClassSection, slot_idx: usize, entry_idx: usize) {
    let entry = section.entry(entry_idx);
    let prev = entry.prev();
    let next = entry.next();
    match index(prev) {
        Some(p) => section.entry(p).set_next(next),
        None => section.slot(slot_idx).set_pending_head(next),
    }
    if let Some(n) = index(next) {
        section.entry(n).set_prev(prev);
    }
    entry.set_prev(NONE_INDEX);
    entry.set_next(NONE_INDEX);
}

/// Detach and return the highest-priority waiter of a slot.
pub(crate) fn pop_head(section: &ClassSection, slot_idx: usize) -> Option<usize> {
    let idx = index(section.slot(slot_idx).pending_head())?;
    unlink(section, slot_idx, idx);
    Some(idx)
}

/// Wait-list entries of one slot, highest priority first.
pub(crate) fn waiters(
    section: &ClassSection,
    slot_idx: usize,
) -> impl Iterator<Item = usize> + '_ {
    std::iter::successors(index(section.slot(slot_idx).pending_head()), move |&i| {
        index(section.entry(i).next())
    })
    .take(MAX_PENDING)
}

/// Locate the in-use entry carrying `request_id`, if any.
pub(crate) fn find_queued(section: &ClassSection, request_id: i32) -> Option<usize> {
    section
        .all_entries()
        .find(|(_, e)| e.in_use() && e.request_id() == request_id)
        .map(|(idx, _)| idx)
}

/// Entries currently on the free list.
pub(crate) fn free_count(section: &ClassSection) -> usize {
    std::iter::successors(index(section.free_head()), |&i| {
        index(section.entry(i).next())
    })
    .take(MAX_PENDING)
    .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::ResClass;
    use crate::layout::{test_region, QueuedRequest};

    fn queue_request(section: &ClassSection, slot: usize, id: i32, priority: u32) -> usize {
        let idx = acquire(section).expect("pool entry available");
        section.entry(idx).store_request(&QueuedRequest {
            request_id: id,
            class_code: 0,
            usage: 0,
            priority,
            max_width: NONE_INDEX,
            max_height: NONE_INDEX,
            pid: std::process::id(),
            target_slot: slot as i32,
            token: id as u64,
        });
        insert_by_priority(section, slot, idx);
        idx
    }

    fn list_ids(section: &ClassSection, slot: usize) -> Vec<i32> {
        waiters(section, slot)
            .map(|i| section.entry(i).request_id())
            .collect()
    }

    #[test]
    fn test_acquire_exhausts_then_fails() {
        let region = test_region();
        let section = region.class(ResClass::Video);
        for _ in 0..MAX_PENDING {
            assert!(acquire(section).is_some());
        }
        assert_eq!(acquire(section), None);
        assert_eq!(free_count(section), 0);
    }

    #[test]
    fn test_release_pushes_to_free_head() {
        let region = test_region();
        let section = region.class(ResClass::Audio);
        let a = acquire(section).unwrap();
        let b = acquire(section).unwrap();
        release(section, a);
        assert_eq!(section.free_head(), a as i32);
        assert_eq!(acquire(section), Some(a));
        release(section, b);
        release(section, a);
        assert_eq!(free_count(section), MAX_PENDING);
    }

    #[test]
    fn test_double_release_keeps_the_free_list_intact() {
        let region = test_region();
        let section = region.class(ResClass::Audio);
        let a = acquire(section).unwrap();
        release(section, a);
        release(section, a);
        let first = acquire(section).unwrap();
        let second = acquire(section).unwrap();
        assert_ne!(first, second, "one record must not serve two requests");
        assert_eq!(free_count(section), MAX_PENDING - 2);
    }

    #[test]
    fn test_insert_orders_by_priority_fifo_on_ties() {
        let region = test_region();
        let section = region.class(ResClass::Video);
        queue_request(section, 0, 1, 5);
        queue_request(section, 0, 2, 1);
        queue_request(section, 0, 3, 5);
        queue_request(section, 0, 4, 3);
        // both priority-5 requests stay in arrival order
        assert_eq!(list_ids(section, 0), vec![1, 3, 4, 2]);
    }

    #[test]
    fn test_insert_highest_becomes_head() {
        let region = test_region();
        let section = region.class(ResClass::Video);
        queue_request(section, 0, 1, 2);
        queue_request(section, 0, 2, 9);
        assert_eq!(list_ids(section, 0), vec![2, 1]);
        assert_eq!(section.slot(0).pending_head(), find_queued(section, 2).unwrap() as i32);
    }

    #[test]
    fn test_unlink_head_middle_tail() {
        let region = test_region();
        let section = region.class(ResClass::Video);
        let a = queue_request(section, 0, 1, 9);
        let b = queue_request(section, 0, 2, 5);
        let c = queue_request(section, 0, 3, 1);

        unlink(section, 0, b);
        assert_eq!(list_ids(section, 0), vec![1, 3]);
        unlink(section, 0, a);
        assert_eq!(list_ids(section, 0), vec![3]);
        unlink(section, 0, c);
        assert_eq!(list_ids(section, 0), Vec::<i32>::new());
        assert_eq!(section.slot(0).pending_head(), NONE_INDEX);
    }

    #[test]
    fn test_pop_head_returns_highest_priority() {
        let region = test_region();
        let section = region.class(ResClass::FrontEnd);
        queue_request(section, 0, 1, 1);
        queue_request(section, 0, 2, 7);
        let head = pop_head(section, 0).unwrap();
        assert_eq!(section.entry(head).request_id(), 2);
        assert_eq!(list_ids(section, 0), vec![1]);
    }

    #[test]
    fn test_lists_are_independent_per_slot() {
        let region = test_region();
        let section = region.class(ResClass::Video);
        queue_request(section, 0, 1, 4);
        queue_request(section, 1, 2, 8);
        assert_eq!(list_ids(section, 0), vec![1]);
        assert_eq!(list_ids(section, 1), vec![2]);
    }

    #[test]
    fn test_find_queued() {
        let region = test_region();
        let section = region.class(ResClass::Audio);
        let idx = queue_request(section, 1, 77, 3);
        assert_eq!(find_queued(section, 77), Some(idx));
        assert_eq!(find_queued(section, 78), None);
        unlink(section, 1, idx);
        release(section, idx);
        assert_eq!(find_queued(section, 77), None);
    }
}
