//! Memory-region descriptors and the region-id high-bit convention.
//!
//! Region ids are 32-bit. The high bit marks "remote-facing" (registered for peers to
//! read); local allocation counters stay below `2^28` so they never collide with that bit.
//! Both the mask and the max-value are fully parenthesized below so neither reads as
//! ambiguous operator precedence at a glance.

use serde::{Deserialize, Serialize};

/// High bit of a region id: set means the region is registered for remote reads.
pub const MEMORY_REGION_ID_REMOTE_MASK: u32 = 1 << 28;
/// Largest region id a local, non-remote-facing allocator may hand out.
pub const MEMORY_REGION_ID_MAX_VALUE: u32 = (1 << 28) - 1;

/// Returns whether `region_id` carries the remote-facing high bit.
pub const fn is_remote_facing(region_id: u32) -> bool {
    region_id & MEMORY_REGION_ID_REMOTE_MASK != 0
}

/// An opaque, remotely-readable (or locally-destined) chunk of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    /// Machine hosting this region.
    pub machine_id: u32,
    /// Region id, dense below [`MEMORY_REGION_ID_MAX_VALUE`] unless remote-facing.
    pub region_id: u32,
    /// Base address of the region (opaque to this crate; interpreted by the transport).
    pub base_address: u64,
    /// Length of the region in bytes.
    pub length: u64,
    /// Access key required to read this region remotely.
    pub access_key: u64,
}

#[cfg(test)]
mod tests {
    use super::{is_remote_facing, MEMORY_REGION_ID_MAX_VALUE, MEMORY_REGION_ID_REMOTE_MASK};

    // ── 1. the mask and max-value constants never overlap ──
    #[test]
    fn mask_and_max_value_disjoint() {
        assert_eq!(MEMORY_REGION_ID_REMOTE_MASK & MEMORY_REGION_ID_MAX_VALUE, 0);
    }

    // ── 2. a dense local id below the mask is not remote-facing ──
    #[test]
    fn dense_local_id_not_remote() {
        assert!(!is_remote_facing(42));
        assert!(!is_remote_facing(MEMORY_REGION_ID_MAX_VALUE));
    }

    // ── 3. setting the high bit marks a region remote-facing ──
    #[test]
    fn high_bit_marks_remote() {
        assert!(is_remote_facing(MEMORY_REGION_ID_REMOTE_MASK));
        assert!(is_remote_facing(MEMORY_REGION_ID_REMOTE_MASK | 7));
    }
}
