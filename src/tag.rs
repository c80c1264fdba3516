//! Message tags
//!
//! Tags minted by [`TagAllocator`] always have their low ten bits set,
//! which keeps them apart from device inbox tags (`local_id + 1`) and the
//! reserved control tags below.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::topology::DeviceId;

/// Tag identifying one logical exchange between two hosts
pub type Tag = i32;

/// Low bit pattern forced onto allocated tags
pub const ALLOCATED_TAG_LOW_BITS: Tag = 1023;

/// Number of distinct allocated tags before the sequence repeats
pub const TAG_CYCLE_LEN: u32 = (1 << 16) - 1;

/// Device properties travel from workers to the master on this tag
pub const DISCOVERY_TAG: Tag = 1024;

/// Largest local device index whose inbox tag stays below the allocated pattern
pub const MAX_LOCAL_DEVICE_ID: u32 = 1021;

/// Inbox tag of a device
pub fn task_tag(device: DeviceId) -> Tag {
    assert!(
        device.local_id <= MAX_LOCAL_DEVICE_ID,
        "device {device} exceeds the inbox tag space"
    );
    device.local_id as Tag + 1
}

/// Whether a tag carries the allocated low-bit pattern
pub fn is_allocated(tag: Tag) -> bool {
    tag > 0 && tag & ALLOCATED_TAG_LOW_BITS == ALLOCATED_TAG_LOW_BITS
}

/// Cycling source of exchange tags
///
/// Owned by the host manager, which restricts allocation to the master.
#[derive(Debug, Default)]
pub struct TagAllocator {
    counter: AtomicU32,
}

impl TagAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next tag
    pub fn next(&self) -> Tag {
        let n = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let base = (n % TAG_CYCLE_LEN) as Tag;
        (base << 10) | ALLOCATED_TAG_LOW_BITS
    }
}
