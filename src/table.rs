//! Typed read-only views over the shared tables.
//!
//! A snapshot is a plain-data copy taken under the store lock, so it is
//! internally consistent even while peer processes keep mutating the
//! control file afterwards. Callers use it for introspection and tests;
//! admission decisions always read the live tables instead.

use crate::caps::{CapFlags, RequestId, ResClass, SlotCaps, UsageFlags};
use crate::layout::{ClassSection, ControlRegion, Owner, MAX_PENDING};
use crate::pool;
use smallvec::SmallVec;

/// Owner block of a granted slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerInfo {
    /// Id the grant was issued under.
    pub request_id: RequestId,
    /// Process holding the grant.
    pub pid: u32,
    /// Priority the slot was won at.
    pub priority: u32,
    /// Usage the owner declared.
    pub usage: UsageFlags,
}

impl From<Owner> for OwnerInfo {
    fn from(owner: Owner) -> Self {
        Self {
            request_id: RequestId(owner.request_id),
            pid: owner.pid,
            priority: owner.priority,
            usage: UsageFlags::from_bits_truncate(owner.usage),
        }
    }
}

/// One slot with its wait list, highest priority first.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    /// Index within the class.
    pub index: usize,
    /// Advertised capabilities.
    pub caps: SlotCaps,
    /// Current owner, if granted.
    pub owner: Option<OwnerInfo>,
    /// Queued request ids, head first.
    pub waiters: SmallVec<[RequestId; 8]>,
}

/// One resource class: admission criteria, slot table, pool occupancy.
#[derive(Debug, Clone)]
pub struct ClassSnapshot {
    /// The class this section describes.
    pub class: ResClass,
    /// Capability bits that participate in admission.
    pub criteria: CapFlags,
    /// All live slots in index order.
    pub slots: Vec<SlotSnapshot>,
    /// Pool entries currently queued or mid-transfer.
    pub pending_in_use: usize,
}

/// Everything the arbiter tracks, copied at one point in time.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    /// Commit counter of the control file when the copy was taken.
    pub revision: u32,
    /// Tie-break policy in force.
    pub requester_wins_tie: bool,
    /// One section per resource class.
    pub classes: Vec<ClassSnapshot>,
}

impl StateSnapshot {
    /// The section captured for `class`.
    pub fn class(&self, class: ResClass) -> &ClassSnapshot {
        &self.classes[class.index()]
    }
}

pub(crate) fn snapshot(region: &ControlRegion) -> StateSnapshot {
    let header = region.header();
    StateSnapshot {
        revision: header.revision(),
        requester_wins_tie: header.requester_wins_tie(),
        classes: ResClass::ALL
            .iter()
            .map(|&class| snapshot_class(region.class(class), class))
            .collect(),
    }
}

fn snapshot_class(section: &ClassSection, class: ResClass) -> ClassSnapshot {
    let slots = (0..section.slot_count())
        .map(|idx| {
            let rec = section.slot(idx);
            SlotSnapshot {
                index: idx,
                caps: rec.caps(),
                owner: rec.owner().map(OwnerInfo::from),
                waiters: pool::waiters(section, idx)
                    .map(|entry| RequestId(section.entry(entry).request_id()))
                    .collect(),
            }
        })
        .collect();
    ClassSnapshot {
        class,
        criteria: CapFlags::from_bits_truncate(section.criteria_raw()),
        slots,
        pending_in_use: MAX_PENDING - pool::free_count(section),
    }
}
