//! Slot admission: decide which slot serves a request and at whose
//! expense.
//!
//! The engine runs two passes over a class's slot table. Pass 0 considers
//! only the *ideal* subset, slots whose limitations are exactly the
//! complement of what the requester needs in full, so fully-capable
//! hardware stays free for requesters that need it. Pass 1 widens to
//! every eligible slot. Within a pass, a free slot wins outright (video
//! prefers the tightest resolution limit that still fits), then a
//! preemptable owner; a pass-0 winner always beats a pass-1 winner.
//! Occupied slots the requester cannot preempt are remembered as the
//! queueing fallback across both passes.

use crate::caps::SizeLimit;
use crate::layout::{ClassSection, Owner};

/// What the requester wants, reduced to the stored representation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AdmissionRequest {
    pub priority: u32,
    pub usage: u32,
    pub max_size: Option<SizeLimit>,
}

/// Where a request lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// A free slot; assign directly.
    Assign { slot: usize },
    /// An owned slot the requester outranks; revoke, then assign.
    Preempt { slot: usize, victim: Owner },
    /// No slot winnable now; wait on this slot's pending list.
    Queue { slot: usize },
    /// No eligible slot exists for this usage/size combination.
    Deny,
}

/// Candidates gathered by one pass over the table.
#[derive(Default)]
struct PassOutcome {
    /// Best free slot and its limit area (`u64::MAX` = unlimited).
    free: Option<(usize, u64)>,
    /// First preemptable owned slot in table order.
    preempt: Option<(usize, Owner)>,
    /// First non-preemptable owned slot in table order.
    pending: Option<usize>,
}

fn scan(
    section: &ClassSection,
    req: &AdmissionRequest,
    requester_wins_tie: bool,
    ideal_only: bool,
) -> PassOutcome {
    let criteria = section.criteria_raw();
    let mut out = PassOutcome::default();

    for (idx, slot) in section.live_slots() {
        let caps = slot.caps_raw();
        // a limitation bit colliding with a needed-in-full bit disqualifies
        if caps & criteria & req.usage != 0 {
            continue;
        }
        if ideal_only && caps & criteria != criteria & !req.usage {
            continue;
        }
        let slot_caps = slot.caps();
        if let (Some(limit), Some(want)) = (slot_caps.limit, req.max_size) {
            if !limit.covers(want) {
                continue;
            }
        }

        match slot.owner() {
            None => {
                let area = slot_caps.limit.map_or(u64::MAX, |l| l.area());
                // strictly smaller area replaces; ties keep table order
                if out.free.map_or(true, |(_, best)| area < best) {
                    out.free = Some((idx, area));
                }
            }
            Some(owner) => {
                let wins = req.priority > owner.priority
                    || (req.priority == owner.priority
                        && req.usage == owner.usage
                        && requester_wins_tie);
                if wins {
                    if out.preempt.is_none() {
                        out.preempt = Some((idx, owner));
                    }
                } else if out.pending.is_none() {
                    out.pending = Some(idx);
                }
            }
        }
    }
    out
}

/// Run both passes and pick the placement for `req`.
pub(crate) fn find_suitable(
    section: &ClassSection,
    req: &AdmissionRequest,
    requester_wins_tie: bool,
) -> Placement {
    let mut pending = None;
    for ideal_only in [true, false] {
        let out = scan(section, req, requester_wins_tie, ideal_only);
        if let Some((slot, _)) = out.free {
            return Placement::Assign { slot };
        }
        if let Some((slot, victim)) = out.preempt {
            return Placement::Preempt { slot, victim };
        }
        if pending.is_none() {
            pending = out.pending;
        }
    }
    match pending {
        Some(slot) => Placement::Queue { slot },
        None => Placement::Deny,
    }
}
