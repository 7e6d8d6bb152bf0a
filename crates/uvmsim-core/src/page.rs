//! Page record and identifier types
//!
//! A `Page` is the unit of translation and migration: the page table, the
//! TLB, and the migration coordinator all trade in copies of this record.

use serde::{Deserialize, Serialize};

/// Process identifier scoping a page table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl Pid {
    /// Get the raw id value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for Pid {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a discrete memory device (accelerator)
pub type DeviceId = u64;

/// An entry in the page table, recording how a virtual address translates
/// to a physical address and where the page currently lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Owning process
    pub pid: Pid,
    /// Virtual address, aligned to `page_size`
    pub v_addr: u64,
    /// Physical address on the owning device
    pub p_addr: u64,
    /// Page size in bytes, a power of two
    pub page_size: u64,
    /// Whether the translation may be used
    pub valid: bool,
    /// Device currently hosting the physical page
    pub device_id: DeviceId,
    /// Unified pages are eligible for automatic on-demand migration
    pub unified: bool,
    /// Set while a migration is in flight for this page
    pub is_migrating: bool,
    /// Pinned pages never migrate again
    pub is_pinned: bool,
}

/// Align `addr` down to the page boundary given `log2_page_size`.
#[inline]
pub const fn align_to_page(addr: u64, log2_page_size: u64) -> u64 {
    (addr >> log2_page_size) << log2_page_size
}

/// Number of pages needed to hold `byte_size` bytes. Zero bytes need
/// zero pages.
#[inline]
pub const fn pages_for_bytes(byte_size: u64, log2_page_size: u64) -> u64 {
    byte_size.div_ceil(1u64 << log2_page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to_page() {
        assert_eq!(align_to_page(0x1fff, 12), 0x1000);
        assert_eq!(align_to_page(0x1000, 12), 0x1000);
        assert_eq!(align_to_page(0xfff, 12), 0);
    }

    #[test]
    fn test_pages_for_bytes() {
        assert_eq!(pages_for_bytes(0, 12), 0);
        assert_eq!(pages_for_bytes(1, 12), 1);
        assert_eq!(pages_for_bytes(4096, 12), 1);
        assert_eq!(pages_for_bytes(4097, 12), 2);
        assert_eq!(pages_for_bytes(8192, 12), 2);
    }
}
