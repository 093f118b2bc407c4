//! Binary layout of the memory-mapped control file.
//!
//! One fixed-size region holds everything the cooperating processes share:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ ControlHeader (64 bytes)                                     │
//! │   magic │ version │ length │ revision │ crc │ next id │ pol  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ ClassSection[0] video    (slot_count │ criteria │ free_head) │
//! │   SlotRecord[0..16]      caps, owner block, wait-list head,  │
//! │                          notify cell (3 futex sems + flags)  │
//! │   PendingRecord[0..48]   request copy, list links, notify    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ ClassSection[1] audio                                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ ClassSection[2] frontend                                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every cross-record reference is a plain `i32` index with `-1` meaning
//! "none", so the region is position-independent across address spaces.
//! All scalar fields are atomics: mutation is serialized by the store lock,
//! but other processes may hold shared references to the same page, and the
//! futex words are touched outside the lock by design.
//!
//! The header CRC covers the *resource tables* only: per class, the slot
//! count, criteria mask, and each live slot's capability and owner fields.
//! Semaphore words change outside the lock and pool links carry no
//! authority, so both stay outside CRC coverage.

use crate::caps::{CapFlags, ResClass, SizeLimit, SlotCaps};
use crate::config::ArbConfig;
use crate::sem::ShmSem;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Magic constant identifying a control file ("RMGR").
pub(crate) const CONTROL_MAGIC: u32 = 0x524D_4752;

/// Current control-file format version.
pub(crate) const CONTROL_VERSION: u32 = 1;

/// Maximum slots per resource class.
pub(crate) const MAX_SLOTS: usize = 16;

/// Pending-pool entries per slot of capacity.
pub(crate) const PENDING_PER_SLOT: usize = 3;

/// Pending-pool entries per class.
pub(crate) const MAX_PENDING: usize = MAX_SLOTS * PENDING_PER_SLOT;

/// Index sentinel meaning "none" in all stored links.
pub(crate) const NONE_INDEX: i32 = -1;

/// Total size of the mapped region in bytes.
pub(crate) const REGION_SIZE: usize = std::mem::size_of::<ControlRegion>();

// ============================================================================
// CRC-32 (IEEE) over the resource tables
// ============================================================================

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            bit += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = build_crc_table();

/// Incremental IEEE CRC-32 used for the table checksum.
pub(crate) struct Crc32(u32);

impl Crc32 {
    pub(crate) fn new() -> Self {
        Self(0xFFFF_FFFF)
    }

    pub(crate) fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            let idx = ((self.0 ^ u32::from(b)) & 0xFF) as usize;
            self.0 = (self.0 >> 8) ^ CRC_TABLE[idx];
        }
    }

    fn update_u32(&mut self, v: u32) {
        self.update(&v.to_le_bytes());
    }

    fn update_i32(&mut self, v: i32) {
        self.update(&v.to_le_bytes());
    }

    pub(crate) fn finish(self) -> u32 {
        self.0 ^ 0xFFFF_FFFF
    }
}

// ============================================================================
// Notify cell
// ============================================================================

/// Event code pending on a notify cell.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NotifyEvent {
    /// Nothing pending; a wake with this code is a join or a stale token.
    None = 0,
    /// A queued request was granted its slot.
    Granted = 1,
    /// The owner is being preempted and must give the slot up.
    Revoked = 2,
}

impl NotifyEvent {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => NotifyEvent::Granted,
            2 => NotifyEvent::Revoked,
            _ => NotifyEvent::None,
        }
    }
}

/// Handshake state embedded in every slot and pending entry: the three
/// semaphores plus the event word and confirmation flags.
#[repr(C)]
pub(crate) struct NotifyCell {
    sem_notify: ShmSem,
    sem_confirm: ShmSem,
    sem_complete: ShmSem,
    event: AtomicU32,
    need_confirm: AtomicU32,
    complete_armed: AtomicU32,
}

impl NotifyCell {
    pub(crate) fn reset(&self) {
        self.sem_notify.reset();
        self.sem_confirm.reset();
        self.sem_complete.reset();
        self.event.store(NotifyEvent::None as u32, Ordering::Release);
        self.need_confirm.store(0, Ordering::Release);
        self.complete_armed.store(0, Ordering::Release);
    }

    pub(crate) fn notify_sem(&self) -> &ShmSem {
        &self.sem_notify
    }

    pub(crate) fn confirm_sem(&self) -> &ShmSem {
        &self.sem_confirm
    }

    pub(crate) fn complete_sem(&self) -> &ShmSem {
        &self.sem_complete
    }

    pub(crate) fn event(&self) -> NotifyEvent {
        NotifyEvent::from_u32(self.event.load(Ordering::Acquire))
    }

    pub(crate) fn set_event(&self, event: NotifyEvent) {
        self.event.store(event as u32, Ordering::Release);
    }

    pub(crate) fn need_confirm(&self) -> bool {
        self.need_confirm.load(Ordering::Acquire) != 0
    }

    pub(crate) fn set_need_confirm(&self, on: bool) {
        self.need_confirm.store(u32::from(on), Ordering::Release);
    }

    pub(crate) fn complete_armed(&self) -> bool {
        self.complete_armed.load(Ordering::Acquire) != 0
    }

    pub(crate) fn set_complete_armed(&self, on: bool) {
        self.complete_armed.store(u32::from(on), Ordering::Release);
    }
}

// ============================================================================
// Slot records
// ============================================================================

/// Owner block of a slot, read and written as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Owner {
    pub request_id: i32,
    pub pid: u32,
    pub priority: u32,
    pub usage: u32,
}

/// One resource slot as stored in the control file (56 bytes).
#[repr(C)]
pub(crate) struct SlotRecord {
    caps: AtomicU32,
    max_width: AtomicI32,
    max_height: AtomicI32,
    owner_request: AtomicI32,
    owner_pid: AtomicU32,
    owner_priority: AtomicU32,
    owner_usage: AtomicU32,
    pending_head: AtomicI32,
    notify: NotifyCell,
}

impl SlotRecord {
    pub(crate) fn reset(&self) {
        self.caps.store(0, Ordering::Release);
        self.max_width.store(NONE_INDEX, Ordering::Release);
        self.max_height.store(NONE_INDEX, Ordering::Release);
        self.clear_owner();
        self.pending_head.store(NONE_INDEX, Ordering::Release);
        self.notify.reset();
    }

    pub(crate) fn caps_raw(&self) -> u32 {
        self.caps.load(Ordering::Acquire)
    }

    /// Typed capability view (flags + optional resolution ceiling).
    pub(crate) fn caps(&self) -> SlotCaps {
        let flags = CapFlags::from_bits_retain(self.caps_raw());
        let w = self.max_width.load(Ordering::Acquire);
        let h = self.max_height.load(Ordering::Acquire);
        let limit = if flags.contains(CapFlags::LIMITED_RESOLUTION) && w >= 0 && h >= 0 {
            Some(SizeLimit::new(w as u32, h as u32))
        } else {
            None
        };
        SlotCaps { flags, limit }
    }

    pub(crate) fn set_caps(&self, caps: SlotCaps) {
        self.caps.store(caps.flags.bits(), Ordering::Release);
        let (w, h) = match caps.limit {
            Some(limit) => (limit.width as i32, limit.height as i32),
            None => (NONE_INDEX, NONE_INDEX),
        };
        self.max_width.store(w, Ordering::Release);
        self.max_height.store(h, Ordering::Release);
    }

    pub(crate) fn max_width_raw(&self) -> i32 {
        self.max_width.load(Ordering::Acquire)
    }

    pub(crate) fn max_height_raw(&self) -> i32 {
        self.max_height.load(Ordering::Acquire)
    }

    /// Current owner, or `None` for a free slot.
    pub(crate) fn owner(&self) -> Option<Owner> {
        let pid = self.owner_pid.load(Ordering::Acquire);
        if pid == 0 {
            return None;
        }
        Some(Owner {
            request_id: self.owner_request.load(Ordering::Acquire),
            pid,
            priority: self.owner_priority.load(Ordering::Acquire),
            usage: self.owner_usage.load(Ordering::Acquire),
        })
    }

    pub(crate) fn set_owner(&self, owner: Owner) {
        self.owner_request.store(owner.request_id, Ordering::Release);
        self.owner_priority.store(owner.priority, Ordering::Release);
        self.owner_usage.store(owner.usage, Ordering::Release);
        // pid last: a nonzero pid marks the block live
        self.owner_pid.store(owner.pid, Ordering::Release);
    }

    /// Zero the owner block back to the unowned state
    /// (`pid == 0`, `request_id == -1`, `priority == 0`, `usage == 0`).
    pub(crate) fn clear_owner(&self) {
        self.owner_pid.store(0, Ordering::Release);
        self.owner_request.store(NONE_INDEX, Ordering::Release);
        self.owner_priority.store(0, Ordering::Release);
        self.owner_usage.store(0, Ordering::Release);
    }

    pub(crate) fn owner_request_raw(&self) -> i32 {
        self.owner_request.load(Ordering::Acquire)
    }

    pub(crate) fn owner_pid_raw(&self) -> u32 {
        self.owner_pid.load(Ordering::Acquire)
    }

    pub(crate) fn owner_priority_raw(&self) -> u32 {
        self.owner_priority.load(Ordering::Acquire)
    }

    pub(crate) fn owner_usage_raw(&self) -> u32 {
        self.owner_usage.load(Ordering::Acquire)
    }

    pub(crate) fn pending_head(&self) -> i32 {
        self.pending_head.load(Ordering::Acquire)
    }

    pub(crate) fn set_pending_head(&self, idx: i32) {
        self.pending_head.store(idx, Ordering::Release);
    }

    pub(crate) fn notify(&self) -> &NotifyCell {
        &self.notify
    }
}

// ============================================================================
// Pending-pool records
// ============================================================================

/// Request copy carried by a queued pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuedRequest {
    pub request_id: i32,
    pub class_code: u32,
    pub usage: u32,
    pub priority: u32,
    pub max_width: i32,
    pub max_height: i32,
    pub pid: u32,
    pub target_slot: i32,
    pub token: u64,
}

/// One pending-pool entry as stored in the control file (80 bytes).
///
/// A free entry is linked through `next` into the class free list; an
/// in-use entry is linked through `prev`/`next` into exactly one slot's
/// wait list. Entries never move while queued.
#[repr(C)]
pub(crate) struct PendingRecord {
    request_id: AtomicI32,
    class_code: AtomicU32,
    usage: AtomicU32,
    priority: AtomicU32,
    max_width: AtomicI32,
    max_height: AtomicI32,
    owner_pid: AtomicU32,
    target_slot: AtomicI32,
    prev: AtomicI32,
    next: AtomicI32,
    in_use: AtomicU32,
    self_index: AtomicI32,
    token: AtomicU64,
    notify: NotifyCell,
}

impl PendingRecord {
    pub(crate) fn reset(&self) {
        self.request_id.store(NONE_INDEX, Ordering::Release);
        self.class_code.store(0, Ordering::Release);
        self.usage.store(0, Ordering::Release);
        self.priority.store(0, Ordering::Release);
        self.max_width.store(NONE_INDEX, Ordering::Release);
        self.max_height.store(NONE_INDEX, Ordering::Release);
        self.owner_pid.store(0, Ordering::Release);
        self.target_slot.store(NONE_INDEX, Ordering::Release);
        self.prev.store(NONE_INDEX, Ordering::Release);
        self.next.store(NONE_INDEX, Ordering::Release);
        self.in_use.store(0, Ordering::Release);
        self.token.store(0, Ordering::Release);
        self.notify.reset();
    }

    pub(crate) fn store_request(&self, req: &QueuedRequest) {
        self.request_id.store(req.request_id, Ordering::Release);
        self.class_code.store(req.class_code, Ordering::Release);
        self.usage.store(req.usage, Ordering::Release);
        self.priority.store(req.priority, Ordering::Release);
        self.max_width.store(req.max_width, Ordering::Release);
        self.max_height.store(req.max_height, Ordering::Release);
        self.owner_pid.store(req.pid, Ordering::Release);
        self.target_slot.store(req.target_slot, Ordering::Release);
        self.token.store(req.token, Ordering::Release);
    }

    pub(crate) fn load_request(&self) -> QueuedRequest {
        QueuedRequest {
            request_id: self.request_id.load(Ordering::Acquire),
            class_code: self.class_code.load(Ordering::Acquire),
            usage: self.usage.load(Ordering::Acquire),
            priority: self.priority.load(Ordering::Acquire),
            max_width: self.max_width.load(Ordering::Acquire),
            max_height: self.max_height.load(Ordering::Acquire),
            pid: self.owner_pid.load(Ordering::Acquire),
            target_slot: self.target_slot.load(Ordering::Acquire),
            token: self.token.load(Ordering::Acquire),
        }
    }

    pub(crate) fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire) != 0
    }

    pub(crate) fn set_in_use(&self, on: bool) {
        self.in_use.store(u32::from(on), Ordering::Release);
    }

    /// This entry's own pool index, written once at section init.
    pub(crate) fn self_index(&self) -> i32 {
        self.self_index.load(Ordering::Acquire)
    }

    fn set_self_index(&self, idx: i32) {
        self.self_index.store(idx, Ordering::Release);
    }

    pub(crate) fn request_id(&self) -> i32 {
        self.request_id.load(Ordering::Acquire)
    }

    pub(crate) fn priority(&self) -> u32 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Release);
    }

    pub(crate) fn set_usage(&self, usage: u32) {
        self.usage.store(usage, Ordering::Release);
    }

    pub(crate) fn pid(&self) -> u32 {
        self.owner_pid.load(Ordering::Acquire)
    }

    pub(crate) fn target_slot(&self) -> i32 {
        self.target_slot.load(Ordering::Acquire)
    }

    pub(crate) fn set_target_slot(&self, slot: i32) {
        self.target_slot.store(slot, Ordering::Release);
    }

    pub(crate) fn prev(&self) -> i32 {
        self.prev.load(Ordering::Acquire)
    }

    pub(crate) fn set_prev(&self, idx: i32) {
        self.prev.store(idx, Ordering::Release);
    }

    pub(crate) fn next(&self) -> i32 {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, idx: i32) {
        self.next.store(idx, Ordering::Release);
    }

    pub(crate) fn notify(&self) -> &NotifyCell {
        &self.notify
    }
}

// ============================================================================
// Class sections and the full region
// ============================================================================

/// Per-class section: table metadata, slot records, pending pool.
#[repr(C, align(64))]
pub(crate) struct ClassSection {
    slot_count: AtomicU32,
    criteria: AtomicU32,
    free_head: AtomicI32,
    _pad: [u8; 52],
    slots: [SlotRecord; MAX_SLOTS],
    entries: [PendingRecord; MAX_PENDING],
}

impl ClassSection {
    /// Number of live slots (prefix of the slot array).
    pub(crate) fn slot_count(&self) -> usize {
        (self.slot_count.load(Ordering::Acquire) as usize).min(MAX_SLOTS)
    }

    pub(crate) fn criteria_raw(&self) -> u32 {
        self.criteria.load(Ordering::Acquire)
    }

    pub(crate) fn free_head(&self) -> i32 {
        self.free_head.load(Ordering::Acquire)
    }

    pub(crate) fn set_free_head(&self, idx: i32) {
        self.free_head.store(idx, Ordering::Release);
    }

    pub(crate) fn slot(&self, idx: usize) -> &SlotRecord {
        &self.slots[idx]
    }

    pub(crate) fn entry(&self, idx: usize) -> &PendingRecord {
        &self.entries[idx]
    }

    /// Live slots in table order.
    pub(crate) fn live_slots(&self) -> impl Iterator<Item = (usize, &SlotRecord)> {
        self.slots.iter().enumerate().take(self.slot_count())
    }

    /// All pool entries in index order.
    pub(crate) fn all_entries(&self) -> impl Iterator<Item = (usize, &PendingRecord)> {
        self.entries.iter().enumerate()
    }

    /// Reinitialize this section from a capability table.
    fn init(&self, class: ResClass, table: &[SlotCaps]) {
        let count = table.len().min(MAX_SLOTS);
        self.slot_count.store(count as u32, Ordering::Release);
        self.criteria
            .store(class.criteria_mask().bits(), Ordering::Release);
        for (idx, slot) in self.slots.iter().enumerate() {
            slot.reset();
            if let Some(caps) = table.get(idx) {
                slot.set_caps(*caps);
            }
        }
        // chain every entry into the free list
        for (idx, entry) in self.entries.iter().enumerate() {
            entry.reset();
            entry.set_self_index(idx as i32);
            let next = if idx + 1 < MAX_PENDING {
                (idx + 1) as i32
            } else {
                NONE_INDEX
            };
            entry.set_next(next);
        }
        self.free_head.store(0, Ordering::Release);
    }
}

/// Header at byte offset zero of the control file (64 bytes).
#[repr(C, align(64))]
pub(crate) struct ControlHeader {
    magic: AtomicU32,
    version: AtomicU32,
    length: AtomicU32,
    revision: AtomicU32,
    crc: AtomicU32,
    next_request_id: AtomicI32,
    policy: AtomicU32,
    _pad: [u8; 36],
}

/// Policy bit: a requester at equal priority and usage wins the tie.
const POLICY_REQUESTER_WINS_TIE: u32 = 1 << 0;

impl ControlHeader {
    pub(crate) fn revision(&self) -> u32 {
        self.revision.load(Ordering::Acquire)
    }

    pub(crate) fn crc(&self) -> u32 {
        self.crc.load(Ordering::Acquire)
    }

    pub(crate) fn requester_wins_tie(&self) -> bool {
        self.policy.load(Ordering::Acquire) & POLICY_REQUESTER_WINS_TIE != 0
    }

    /// Allocate the next request id. Ids stay strictly positive; the
    /// counter skips back to 1 if it ever reaches `i32::MAX`.
    pub(crate) fn alloc_request_id(&self) -> i32 {
        let id = self.next_request_id.fetch_add(1, Ordering::AcqRel);
        if id >= i32::MAX - 1 || id <= 0 {
            self.next_request_id.store(1, Ordering::Release);
            return self.next_request_id.fetch_add(1, Ordering::AcqRel);
        }
        id
    }

    pub(crate) fn peek_next_request_id(&self) -> i32 {
        self.next_request_id.load(Ordering::Acquire)
    }
}

/// Ways a region can fail validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LayoutFault {
    /// Magic constant does not match.
    Magic { found: u32 },
    /// Format version does not match.
    Version { found: u32 },
    /// Recorded region length does not match the mapped size.
    Length { found: u32 },
    /// Stored CRC does not match the recomputed table CRC.
    Crc { stored: u32, computed: u32 },
}

/// The entire mapped control file.
#[repr(C)]
pub(crate) struct ControlRegion {
    header: ControlHeader,
    classes: [ClassSection; ResClass::ALL.len()],
}

impl ControlRegion {
    pub(crate) fn header(&self) -> &ControlHeader {
        &self.header
    }

    pub(crate) fn class(&self, class: ResClass) -> &ClassSection {
        &self.classes[class.index()]
    }

    /// Recompute the CRC over the resource tables.
    pub(crate) fn table_crc(&self) -> u32 {
        let mut crc = Crc32::new();
        for class in ResClass::ALL {
            let section = self.class(class);
            crc.update_u32(section.slot_count() as u32);
            crc.update_u32(section.criteria_raw());
            for (_, slot) in section.live_slots() {
                crc.update_u32(slot.caps_raw());
                crc.update_i32(slot.max_width_raw());
                crc.update_i32(slot.max_height_raw());
                crc.update_i32(slot.owner_request_raw());
                crc.update_u32(slot.owner_pid_raw());
                crc.update_u32(slot.owner_priority_raw());
                crc.update_u32(slot.owner_usage_raw());
            }
        }
        crc.finish()
    }

    /// Check magic, version, length, and CRC.
    pub(crate) fn check(&self) -> Result<(), LayoutFault> {
        let magic = self.header.magic.load(Ordering::Acquire);
        if magic != CONTROL_MAGIC {
            return Err(LayoutFault::Magic { found: magic });
        }
        let version = self.header.version.load(Ordering::Acquire);
        if version != CONTROL_VERSION {
            return Err(LayoutFault::Version { found: version });
        }
        let length = self.header.length.load(Ordering::Acquire);
        if length as usize != REGION_SIZE {
            return Err(LayoutFault::Length { found: length });
        }
        let stored = self.header.crc();
        let computed = self.table_crc();
        if stored != computed {
            return Err(LayoutFault::Crc { stored, computed });
        }
        Ok(())
    }

    /// Reinitialize the whole region from a configuration. Every owner,
    /// queue, and semaphore is discarded.
    pub(crate) fn init(&self, config: &ArbConfig) {
        for class in ResClass::ALL {
            self.class(class).init(class, config.class_table(class));
        }
        let policy = if config.requester_wins_priority_tie {
            POLICY_REQUESTER_WINS_TIE
        } else {
            0
        };
        self.header.policy.store(policy, Ordering::Release);
        self.header.next_request_id.store(1, Ordering::Release);
        self.header.revision.store(1, Ordering::Release);
        self.header
            .length
            .store(REGION_SIZE as u32, Ordering::Release);
        self.header
            .version
            .store(CONTROL_VERSION, Ordering::Release);
        self.header.crc.store(self.table_crc(), Ordering::Release);
        // magic last: readers treat the region as live once it appears
        self.header.magic.store(CONTROL_MAGIC, Ordering::Release);
    }

    /// Recompute and store the CRC; bump the revision when the tables
    /// actually changed. Called as the last action before unlocking.
    pub(crate) fn commit(&self) {
        let computed = self.table_crc();
        if computed != self.header.crc() {
            self.header.revision.fetch_add(1, Ordering::AcqRel);
            self.header.crc.store(computed, Ordering::Release);
        }
    }

    /// Corrupt the stored CRC (test support for recovery paths).
    #[cfg(test)]
    pub(crate) fn corrupt_crc_for_test(&self) {
        self.header.crc.fetch_xor(0xFF, Ordering::AcqRel);
    }
}

const _: () = assert!(std::mem::size_of::<ShmSem>() == 4);
const _: () = assert!(std::mem::size_of::<NotifyCell>() == 24);
const _: () = assert!(std::mem::size_of::<SlotRecord>() == 56);
const _: () = assert!(std::mem::size_of::<PendingRecord>() == 80);
const _: () = assert!(std::mem::size_of::<ControlHeader>() == 64);
const _: () = assert!(std::mem::align_of::<ControlHeader>() == 64);
const _: () =
    assert!(std::mem::size_of::<ClassSection>() == 64 + 56 * MAX_SLOTS + 80 * MAX_PENDING);
const _: () = assert!(std::mem::size_of::<ControlRegion>() % 64 == 0);

#[cfg(test)]
pub(crate) fn test_region() -> Box<ControlRegion> {
    // SAFETY: every field is an integer, atomic integer, or padding, for
    // which the all-zero bit pattern is a valid value.
    let region: Box<ControlRegion> =
        unsafe { Box::new(std::mem::MaybeUninit::zeroed().assume_init()) };
    region.init(&ArbConfig::builtin_defaults());
    region
}
