//! Resource classes, capability and usage bitmasks, and request vocabulary.
//!
//! The arbiter manages three fixed classes of decode hardware. Slots
//! advertise [`CapFlags`]; requesters declare [`UsageFlags`]. The two sets
//! share bit positions so that a `LIMITED_*` capability collides with the
//! matching `FULL_*` usage requirement during admission.
//!
//! All bitmask types are stored as raw `u32` words in the shared control
//! file; the typed wrappers exist only on the process-local side.

use bitflags::bitflags;
use std::fmt;

// ============================================================================
// Resource classes
// ============================================================================

/// The three arbitrated resource classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResClass {
    /// Video decoder slots.
    Video,
    /// Audio decoder slots.
    Audio,
    /// Front-end (tuner) slots.
    FrontEnd,
}

impl ResClass {
    /// All classes, in control-file section order.
    pub const ALL: [ResClass; 3] = [ResClass::Video, ResClass::Audio, ResClass::FrontEnd];

    /// Section index inside the control file.
    pub(crate) fn index(self) -> usize {
        match self {
            ResClass::Video => 0,
            ResClass::Audio => 1,
            ResClass::FrontEnd => 2,
        }
    }

    /// Capability bits that matter for admission in this class.
    ///
    /// Bits outside the criteria mask (e.g. `HARDWARE`) are informational
    /// and never disqualify a candidate slot.
    pub fn criteria_mask(self) -> CapFlags {
        match self {
            ResClass::Video => {
                CapFlags::LIMITED_RESOLUTION
                    | CapFlags::LIMITED_QUALITY
                    | CapFlags::LIMITED_PERFORMANCE
            }
            ResClass::Audio | ResClass::FrontEnd => CapFlags::empty(),
        }
    }

    /// Usage bits a requester may set for this class.
    pub fn valid_usage(self) -> UsageFlags {
        match self {
            ResClass::Video => {
                UsageFlags::FULL_RESOLUTION | UsageFlags::FULL_QUALITY | UsageFlags::FULL_PERFORMANCE
            }
            ResClass::Audio | ResClass::FrontEnd => UsageFlags::empty(),
        }
    }

    /// Lower-case name as used in config files and dumps.
    pub fn as_str(self) -> &'static str {
        match self {
            ResClass::Video => "video",
            ResClass::Audio => "audio",
            ResClass::FrontEnd => "frontend",
        }
    }
}

impl fmt::Display for ResClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Capability and usage bitmasks
// ============================================================================

bitflags! {
    /// Capability bits advertised by a resource slot.
    ///
    /// The low bits describe limitations and line up with the `FULL_*`
    /// usage bits; the high bits describe the implementation kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CapFlags: u32 {
        /// Slot can only decode up to a declared width x height.
        const LIMITED_RESOLUTION = 1 << 0;
        /// Slot decodes at reduced quality.
        const LIMITED_QUALITY = 1 << 1;
        /// Slot decodes at reduced performance.
        const LIMITED_PERFORMANCE = 1 << 2;
        /// Hardware-backed implementation.
        const HARDWARE = 1 << 16;
        /// Software fallback implementation.
        const SOFTWARE = 1 << 17;
    }
}

bitflags! {
    /// Usage bits declared by a requester.
    ///
    /// A set bit means the requester needs the full, unlimited form of the
    /// matching capability axis.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsageFlags: u32 {
        /// Needs full resolution (rejects resolution-limited slots).
        const FULL_RESOLUTION = 1 << 0;
        /// Needs full quality.
        const FULL_QUALITY = 1 << 1;
        /// Needs full performance.
        const FULL_PERFORMANCE = 1 << 2;
    }
}

// ============================================================================
// Resolution payloads
// ============================================================================

/// A width x height ceiling, used both as a slot's declared limit and as a
/// requester's stated maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimit {
    /// Maximum width in pixels.
    pub width: u32,
    /// Maximum height in pixels.
    pub height: u32,
}

impl SizeLimit {
    /// Create a limit from width and height.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel area, used to rank limited slots (smaller is tighter).
    pub(crate) fn area(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Whether a stream bounded by `other` fits under this limit.
    pub(crate) fn covers(self, other: SizeLimit) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl fmt::Display for SizeLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Capability view of one slot: flags plus the optional resolution ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCaps {
    /// Advertised capability bits.
    pub flags: CapFlags,
    /// Resolution ceiling, meaningful when `LIMITED_RESOLUTION` is set.
    pub limit: Option<SizeLimit>,
}

impl SlotCaps {
    /// A slot with the given flags and no resolution ceiling.
    pub fn new(flags: CapFlags) -> Self {
        Self { flags, limit: None }
    }

    /// A resolution-limited slot.
    pub fn limited(flags: CapFlags, width: u32, height: u32) -> Self {
        Self {
            flags: flags | CapFlags::LIMITED_RESOLUTION,
            limit: Some(SizeLimit::new(width, height)),
        }
    }
}

impl fmt::Display for SlotCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.flags.bits())?;
        if let Some(limit) = self.limit {
            write!(f, " ({limit})")?;
        }
        Ok(())
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Identifier of a granted or queued request.
///
/// Allocated from a shared monotonically increasing counter, so ids are
/// unique across every process sharing one control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) i32);

impl RequestId {
    /// Raw id as stored in the control file.
    pub fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a caller asks the arbiter for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSpec {
    /// Resource class to acquire.
    pub class: ResClass,
    /// Declared usage requirements.
    pub usage: UsageFlags,
    /// Priority; numerically higher wins.
    pub priority: u32,
    /// Largest frame the caller intends to decode, if known. Only
    /// meaningful for video; bounds which limited slots qualify.
    pub max_size: Option<SizeLimit>,
}

impl RequestSpec {
    /// Request with full usage requirements at the given priority.
    pub fn new(class: ResClass, priority: u32) -> Self {
        Self {
            class,
            usage: class.valid_usage(),
            priority,
            max_size: None,
        }
    }

    /// Replace the usage bits.
    pub fn with_usage(mut self, usage: UsageFlags) -> Self {
        self.usage = usage;
        self
    }

    /// Declare the largest frame the caller will decode.
    pub fn with_max_size(mut self, width: u32, height: u32) -> Self {
        self.max_size = Some(SizeLimit::new(width, height));
        self
    }
}

/// Event delivered to a request's callback by its notify worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantEvent {
    /// A queued request was granted its slot.
    Granted,
    /// An owned slot was revoked by a higher-priority requester; the owner
    /// must stop using the hardware and call release.
    Revoked,
}

/// Callback invoked on grant or revocation, outside the store lock, on a
/// short-lived worker thread belonging to the requesting process.
pub type EventFn = Box<dyn FnMut(RequestId, GrantEvent) + Send + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_and_cap_bits_line_up() {
        assert_eq!(
            CapFlags::LIMITED_RESOLUTION.bits(),
            UsageFlags::FULL_RESOLUTION.bits()
        );
        assert_eq!(
            CapFlags::LIMITED_QUALITY.bits(),
            UsageFlags::FULL_QUALITY.bits()
        );
        assert_eq!(
            CapFlags::LIMITED_PERFORMANCE.bits(),
            UsageFlags::FULL_PERFORMANCE.bits()
        );
    }

    #[test]
    fn test_video_criteria_mask_covers_limited_bits() {
        let mask = ResClass::Video.criteria_mask();
        assert!(mask.contains(CapFlags::LIMITED_RESOLUTION));
        assert!(mask.contains(CapFlags::LIMITED_QUALITY));
        assert!(mask.contains(CapFlags::LIMITED_PERFORMANCE));
        assert!(!mask.contains(CapFlags::HARDWARE));
        assert!(ResClass::Audio.criteria_mask().is_empty());
        assert!(ResClass::FrontEnd.criteria_mask().is_empty());
    }

    #[test]
    fn test_size_limit_ordering() {
        let small = SizeLimit::new(640, 480);
        let large = SizeLimit::new(1920, 1080);
        assert!(small.area() < large.area());
        assert!(large.covers(small));
        assert!(!small.covers(large));
        assert!(small.covers(small));
    }

    #[test]
    fn test_class_names() {
        assert_eq!(ResClass::Video.to_string(), "video");
        assert_eq!(ResClass::Audio.to_string(), "audio");
        assert_eq!(ResClass::FrontEnd.to_string(), "frontend");
    }

    #[test]
    fn test_request_spec_builder() {
        let spec = RequestSpec::new(ResClass::Video, 3)
            .with_usage(UsageFlags::FULL_QUALITY)
            .with_max_size(1280, 720);
        assert_eq!(spec.priority, 3);
        assert_eq!(spec.usage, UsageFlags::FULL_QUALITY);
        assert_eq!(spec.max_size, Some(SizeLimit::new(1280, 720)));
    }
}
