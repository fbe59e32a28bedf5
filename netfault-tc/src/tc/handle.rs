//! TC handle computation and common request infrastructure.
//!
//! TC handles are 32-bit values split into major:minor (16:16 bits). Every fault tree installed by
//! `netfault` shares the same root. Below it, each *combination* of faults a packet can be subject
//! to gets its own class, numbered after a bit mask of the fault kinds it carries:
//!
//! | Component            | Handle            | Example (mask `0b1100`) |
//! |----------------------|-------------------|-------------------------|
//! | HTB root             | `1:0`             | `N/A`                   |
//! | Pass-through class   | `1:1`             | `N/A`                   |
//! | Fault class          | `1:(0x10+mask)`   | `1:1c`                  |
//! | Fault leaf qdisc     | `(0x10+mask):0`   | `1c:0`                  |
//! | Rate qdisc           | `(0x30+mask):0`   | `3c:0`, below `1c:1`    |
//! | Ingress qdisc        | `ffff:0`          | `N/A`                   |
//!
//! Classifiers form one ordered decision list per direction and are identified by their
//! preference, starting at 1.

use rtnetlink::packet_route::tc::TcHandle;

/// Handle of the root qdisc (`1:0`).
pub const ROOT_HANDLE: u32 = 0x0001_0000;

/// Handle of the pass-through class (`1:1`). Traffic that no classifier claims ends up here.
pub const PASS_THROUGH_CLASS: u32 = 0x0001_0001;

/// Parent value used by the kernel for root qdiscs (`TC_H_ROOT`).
pub const ROOT_PARENT: u32 = u32::MAX;

/// Parent value used by the kernel for the ingress qdisc (`TC_H_INGRESS`).
pub const INGRESS_PARENT: u32 = 0xFFFF_FFF1;

/// Handle of the ingress qdisc (`ffff:0`). Ingress classifiers are attached to it.
pub const INGRESS_HANDLE: u32 = 0xFFFF_0000;

/// Added to a fault mask to compute class minors and leaf majors. This keeps class 1:1 reserved
/// as the pass-through class.
pub const MASK_OFFSET: u32 = 0x10;

/// Added to a fault mask to compute the major of the rate qdisc chained below a netem leaf.
pub const RATE_OFFSET: u32 = 0x30;

/// Highest fault mask, one bit per fault kind.
pub const MAX_MASK: u8 = 0x1F;

/// Maximum number of classifiers per scope.
pub const MAX_FILTERS_PER_GROUP: usize = 127;

/// Maximum number of classifiers in one decision list.
pub const MAX_RULES: usize = 4096;

/// Common fields shared by all qdisc/class/filter requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QdiscRequestInner {
    /// The network interface index (from `if_nametoindex`).
    pub interface_index: i32,
    /// The parent handle (where this qdisc/class attaches).
    pub parent: TcHandle,
    /// This qdisc/class's own handle.
    pub handle: TcHandle,
}

impl QdiscRequestInner {
    /// Create a new request for the given interface, defaulting to root parent.
    pub fn new(index: i32) -> Self {
        Self { interface_index: index, parent: TcHandle::ROOT, handle: TcHandle::default() }
    }

    /// Set the parent handle.
    pub fn with_parent(mut self, parent: TcHandle) -> Self {
        self.parent = parent;
        self
    }

    /// Set this qdisc/class's handle.
    pub fn with_handle(mut self, handle: TcHandle) -> Self {
        self.handle = handle;
        self
    }
}

/// Convert a [`TcHandle`] back to its raw 32-bit representation.
#[inline]
pub fn raw(handle: TcHandle) -> u32 {
    ((handle.major as u32) << 16) | handle.minor as u32
}

/// Format a raw handle the way `tc` prints it, e.g. `1:1c` or `1c:0`.
pub fn display(handle: u32) -> String {
    match handle {
        ROOT_PARENT => "root".to_string(),
        INGRESS_PARENT => "ingress".to_string(),
        _ => format!("{:x}:{:x}", handle >> 16, handle & 0xFFFF),
    }
}

/// Compute the fault class handle for a mask: `1:(0x10 + mask)`.
///
/// ```
/// use netfault_tc::tc::handle::fault_class;
/// assert_eq!(fault_class(0b1100), 0x0001_001C); // 1:1c
/// ```
pub fn fault_class(mask: u8) -> u32 {
    (1 << 16) | (MASK_OFFSET + mask as u32)
}

/// Compute the leaf qdisc handle for a mask: `(0x10 + mask):0`.
///
/// Qdisc handles must have minor=0 (kernel rejects non-zero minor).
pub fn fault_leaf(mask: u8) -> u32 {
    (MASK_OFFSET + mask as u32) << 16
}

/// Compute the handle of the rate qdisc chained below the netem leaf of a mask.
///
/// ```
/// use netfault_tc::tc::handle::{fault_leaf, rate_leaf, rate_parent};
/// assert_eq!(rate_leaf(0b10100), 0x0044_0000); // 44:0
/// assert_eq!(rate_parent(0b10100), fault_leaf(0b10100) | 1); // 24:1
/// ```
pub fn rate_leaf(mask: u8) -> u32 {
    (RATE_OFFSET + mask as u32) << 16
}

/// The netem child class a rate qdisc attaches to: `(0x10 + mask):1`.
pub fn rate_parent(mask: u8) -> u32 {
    fault_leaf(mask) | 1
}

/// Returns the fault mask of a fault class handle, if it is one.
pub fn mask_of_class(handle: u32) -> Option<u8> {
    if handle >> 16 != 1 {
        return None;
    }
    let minor = handle & 0xFFFF;
    minor
        .checked_sub(MASK_OFFSET)
        .filter(|mask| (1..=MAX_MASK as u32).contains(mask))
        .map(|mask| mask as u8)
}

/// Preference of the `index`-th classifier of a decision list, if within budget.
pub fn rule_pref(index: usize) -> Option<u16> {
    (index < MAX_RULES).then(|| index as u16 + 1)
}
