//! Buddy allocator for a device's physical storage
//!
//! The buddy tree stores no explicit nodes. A block's level, tree index,
//! and buddy are recomputed from its numeric position (see
//! [`TreeGeometry`]); two bitfields carry the rest of the bookkeeping:
//!
//! - the *split* field records, per node, whether the block was divided
//!   into two children;
//! - the *merge* field holds, per parent node, the XOR of its children's
//!   allocated states, so a freed block may coalesce exactly when the
//!   parent bit has returned to zero.
//!
//! Multi-page allocations are handed out as one run of consecutive page
//! addresses; a run tracker counts the pages still live so a fragmented
//! free (pages returned one at a time, in any order) still coalesces the
//! whole run at once.

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use crate::error::{Result, VmError};
use crate::page::DeviceId;

/// Fixed-size bit vector addressed by computed tree index
#[derive(Debug, Clone)]
pub struct BitField {
    words: Vec<u64>,
}

impl BitField {
    /// Create a field of `num_bits` zeroed bits
    pub fn new(num_bits: usize) -> Self {
        Self {
            words: vec![0; num_bits.div_ceil(64)],
        }
    }

    /// Flip the bit at `index`
    #[inline]
    pub fn toggle(&mut self, index: u64) {
        self.words[(index / 64) as usize] ^= 1 << (index % 64);
    }

    /// Test the bit at `index`
    #[inline]
    pub fn test(&self, index: u64) -> bool {
        self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }
}

/// Pure position arithmetic for the implicit buddy tree
///
/// Level 0 is the whole storage; level `k` blocks are `storage / 2^k`
/// bytes. None of these functions touch allocator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeGeometry {
    /// First physical address of the device's storage
    pub base: u64,
    /// Total storage in bytes, a power of two
    pub storage_size: u64,
}

impl TreeGeometry {
    /// Byte size of a block at `level`
    #[inline]
    pub fn size_of_level(&self, level: u32) -> u64 {
        self.storage_size >> level
    }

    /// Position of the block holding `ptr` among its level's blocks
    #[inline]
    pub fn index_in_level_of(&self, ptr: u64, level: u32) -> u64 {
        (ptr - self.base) / self.size_of_level(level)
    }

    /// Index of the block's node in the implicit tree
    #[inline]
    pub fn index_of_block(&self, ptr: u64, level: u32) -> u64 {
        (1 << level) + self.index_in_level_of(ptr, level) - 1
    }

    /// Address of the block's sibling at `level`
    #[inline]
    pub fn buddy_of(&self, addr: u64, level: u32) -> u64 {
        if self.index_in_level_of(addr, level) % 2 == 0 {
            addr + self.size_of_level(level)
        } else {
            addr - self.size_of_level(level)
        }
    }
}

/// Remaining live pages of one multi-page allocation run
#[derive(Debug)]
struct RunTracker {
    pages_left: usize,
}

/// Buddy allocator over one device's physical page range
#[derive(Debug)]
pub struct BuddyAllocator {
    device_id: DeviceId,
    log2_page_size: u64,

    initial_address: u64,
    storage_size: u64,
    // Free blocks per level; level 0 is the whole storage.
    free_list: Vec<VecDeque<u64>>,
    split: BitField,
    merge: BitField,
    // Page address -> run start, run start -> live-page count.
    page_to_run: HashMap<u64, u64>,
    runs: HashMap<u64, RunTracker>,
    // Initial address arrived before the storage size did.
    init_pending: bool,
}

impl BuddyAllocator {
    /// Create an allocator for `device_id` with empty geometry; call
    /// `set_storage_size` and `set_initial_address` (in either order)
    /// before allocating.
    pub fn new(device_id: DeviceId, log2_page_size: u64) -> Self {
        Self {
            device_id,
            log2_page_size,
            initial_address: 0,
            storage_size: 0,
            free_list: Vec::new(),
            split: BitField::new(0),
            merge: BitField::new(0),
            page_to_run: HashMap::new(),
            runs: HashMap::new(),
            init_pending: false,
        }
    }

    /// Set the base physical address of the managed range
    pub fn set_initial_address(&mut self, addr: u64) {
        self.initial_address = addr;
        self.page_to_run.clear();
        self.runs.clear();

        if !self.free_list.is_empty() {
            self.free_list[0].push_back(addr);
            self.init_pending = false;
        } else {
            self.init_pending = true;
        }
    }

    /// Base physical address of the managed range
    pub fn initial_address(&self) -> u64 {
        self.initial_address
    }

    /// Set the managed storage size, building one free list per tree level
    pub fn set_storage_size(&mut self, size: u64) {
        self.storage_size = size;
        let mut order = self.log2_page_size;
        while (1u64 << order) < size {
            order += 1;
        }
        let levels = (order - self.log2_page_size) as usize;

        self.free_list = vec![VecDeque::new(); levels + 1];
        self.split = BitField::new(1 << levels);
        self.merge = BitField::new(1 << levels);

        if self.init_pending {
            self.free_list[0].push_back(self.initial_address);
            self.init_pending = false;
        }
    }

    /// Managed storage size in bytes
    pub fn storage_size(&self) -> u64 {
        self.storage_size
    }

    fn geometry(&self) -> TreeGeometry {
        TreeGeometry {
            base: self.initial_address,
            storage_size: self.storage_size,
        }
    }

    /// Whether no free block remains at any level
    pub fn no_available_paddrs(&self) -> bool {
        self.free_list.iter().all(|list| list.is_empty())
    }

    /// Allocate one page
    pub fn allocate_page(&mut self) -> Result<u64> {
        Ok(self.allocate_multiple_pages(1)?[0])
    }

    /// Allocate a run of `num_pages` consecutive pages, returning each
    /// page's physical address
    pub fn allocate_multiple_pages(&mut self, num_pages: usize) -> Result<Vec<u64>> {
        let page_size = 1u64 << self.log2_page_size;
        if self.free_list.is_empty() {
            return Err(VmError::OutOfDeviceMemory {
                device_id: self.device_id,
                num_pages,
            });
        }
        let deepest = (self.free_list.len() - 1) as u32;

        let mut order = self.log2_page_size;
        while (1u64 << order) < num_pages as u64 * page_size {
            order += 1;
        }
        let wanted = (order - self.log2_page_size) as u32;
        if wanted > deepest {
            return Err(VmError::OutOfDeviceMemory {
                device_id: self.device_id,
                num_pages,
            });
        }
        let level = deepest - wanted;

        // Scan from the target level toward the root for a free block.
        let mut i = level as i64;
        while i >= 0 && self.free_list[i as usize].is_empty() {
            i -= 1;
        }
        if i < 0 {
            return Err(VmError::OutOfDeviceMemory {
                device_id: self.device_id,
                num_pages,
            });
        }
        let mut i = i as u32;

        let geo = self.geometry();
        let Some(block) = self.free_list[i as usize].pop_front() else {
            return Err(VmError::OutOfDeviceMemory {
                device_id: self.device_id,
                num_pages,
            });
        };

        if i == level && i > 0 {
            self.merge.toggle(geo.index_of_block(block, i - 1));
        }

        // Split down to the target level, parking each unused buddy half.
        while i < level {
            self.split.toggle(geo.index_of_block(block, i));
            self.merge.toggle(geo.index_of_block(block, i));
            i += 1;
            let buddy = geo.buddy_of(block, i);
            self.free_list[i as usize].push_back(buddy);
        }

        self.runs.insert(block, RunTracker {
            pages_left: num_pages,
        });

        let mut p_addrs = Vec::with_capacity(num_pages);
        let mut addr = block;
        for _ in 0..num_pages {
            p_addrs.push(addr);
            self.page_to_run.insert(addr, block);
            addr += page_size;
        }

        trace!(
            device_id = self.device_id,
            block = format_args!("{block:#x}"),
            num_pages,
            "allocated run"
        );

        Ok(p_addrs)
    }

    /// Return one page of a run. When the run's last page comes back, the
    /// whole run is freed into the tree and coalesced upward.
    pub fn add_single_paddr(&mut self, addr: u64) -> Result<()> {
        let run_start = self
            .page_to_run
            .remove(&addr)
            .ok_or(VmError::UntrackedFree {
                device_id: self.device_id,
                p_addr: addr,
            })?;

        let tracker = self
            .runs
            .get_mut(&run_start)
            .ok_or(VmError::UntrackedFree {
                device_id: self.device_id,
                p_addr: addr,
            })?;
        tracker.pages_left -= 1;
        if tracker.pages_left == 0 {
            self.runs.remove(&run_start);
            self.free_block(run_start);
        }
        Ok(())
    }

    /// Free a block, merging with its buddy one level at a time while the
    /// buddy is also free
    fn free_block(&mut self, mut addr: u64) {
        let geo = self.geometry();
        let mut level = self.level_of_block(addr);
        while level > 0 {
            self.merge.toggle(geo.index_of_block(addr, level - 1));
            if !self.block_or_buddy_is_allocated(addr, level) {
                self.split.toggle(geo.index_of_block(addr, level - 1));
                let buddy = geo.buddy_of(addr, level);
                let list = &mut self.free_list[level as usize];
                if let Some(pos) = list.iter().position(|&b| b == buddy) {
                    list.remove(pos);
                }
                if buddy < addr {
                    addr = buddy;
                }
                level -= 1;
            } else {
                self.free_list[level as usize].push_back(addr);
                return;
            }
        }
        trace!(
            device_id = self.device_id,
            block = format_args!("{addr:#x}"),
            "block merged to level 0"
        );
        self.free_list[0].push_back(addr);
    }

    /// Recover a block's level from the split bits: the first ancestor
    /// level showing no finer split marks the block's own level.
    fn level_of_block(&self, addr: u64) -> u32 {
        let geo = self.geometry();
        let mut n = (self.free_list.len() - 1) as u32;
        while n > 0 {
            if self.split.test(geo.index_of_block(addr, n - 1)) {
                return n;
            }
            n -= 1;
        }
        0
    }

    fn block_or_buddy_is_allocated(&self, ptr: u64, level: u32) -> bool {
        self.merge.test(self.geometry().index_of_block(ptr, level - 1))
    }

    /// Free blocks currently parked at `level` (test hook)
    #[cfg(test)]
    fn free_blocks_at(&self, level: u32) -> Vec<u64> {
        self.free_list[level as usize].iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(storage: u64, base: u64) -> BuddyAllocator {
        let mut a = BuddyAllocator::new(1, 12);
        a.set_storage_size(storage);
        a.set_initial_address(base);
        a
    }

    #[test]
    fn test_geometry_helpers() {
        let geo = TreeGeometry {
            base: 0x1000,
            storage_size: 0x10000, // 16 pages of 4KB
        };
        assert_eq!(geo.size_of_level(0), 0x10000);
        assert_eq!(geo.size_of_level(4), 0x1000);
        assert_eq!(geo.index_in_level_of(0x1000, 4), 0);
        assert_eq!(geo.index_in_level_of(0x3000, 4), 2);
        assert_eq!(geo.index_of_block(0x1000, 0), 0);
        assert_eq!(geo.index_of_block(0x1000, 1), 1);
        assert_eq!(geo.index_of_block(0x9000, 1), 2);
        // Even blocks buddy up, odd blocks buddy down.
        assert_eq!(geo.buddy_of(0x1000, 4), 0x2000);
        assert_eq!(geo.buddy_of(0x2000, 4), 0x1000);
    }

    #[test]
    fn test_init_order_independence() {
        let mut a = BuddyAllocator::new(1, 12);
        a.set_initial_address(0x1000);
        a.set_storage_size(0x4000);
        assert!(!a.no_available_paddrs());

        let mut b = BuddyAllocator::new(1, 12);
        b.set_storage_size(0x4000);
        b.set_initial_address(0x1000);
        assert!(!b.no_available_paddrs());

        assert_eq!(
            a.allocate_page().unwrap(),
            b.allocate_page().unwrap()
        );
    }

    #[test]
    fn test_single_page_round_trip() {
        let mut a = allocator(0x4000, 0x1000); // 4 pages
        let p1 = a.allocate_page().unwrap();
        let p2 = a.allocate_page().unwrap();
        assert_ne!(p1, p2);

        a.add_single_paddr(p1).unwrap();
        a.add_single_paddr(p2).unwrap();

        // Everything freed: the whole storage is one level-0 block again.
        assert_eq!(a.free_blocks_at(0), vec![0x1000]);
        for level in 1..=2 {
            assert!(a.free_blocks_at(level).is_empty());
        }
    }

    #[test]
    fn test_sibling_merge_restores_parent() {
        let mut a = allocator(0x8000, 0x0); // 8 pages, 3 levels below root
        let p1 = a.allocate_page().unwrap();
        let p2 = a.allocate_page().unwrap();
        // The two pages are buddies under one level-2 parent.
        assert_eq!(p2, 0x1000);

        a.add_single_paddr(p1).unwrap();
        a.add_single_paddr(p2).unwrap();

        // Freeing both siblings re-coalesces all the way to the root.
        assert_eq!(a.free_blocks_at(0), vec![0x0]);
    }

    #[test]
    fn test_multi_page_run_frees_once_fully_returned() {
        let mut a = allocator(0x8000, 0x0);
        let run = a.allocate_multiple_pages(4).unwrap();
        assert_eq!(run, vec![0x0, 0x1000, 0x2000, 0x3000]);
        // The unused upper half parks in level 1 at allocation time.
        assert_eq!(a.free_blocks_at(1), vec![0x4000]);

        // Return pages out of order; nothing frees until the last one.
        a.add_single_paddr(run[2]).unwrap();
        a.add_single_paddr(run[0]).unwrap();
        a.add_single_paddr(run[3]).unwrap();
        assert_eq!(a.free_blocks_at(1), vec![0x4000]);
        assert!(a.free_blocks_at(0).is_empty());

        a.add_single_paddr(run[1]).unwrap();
        assert_eq!(a.free_blocks_at(0), vec![0x0]);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut a = allocator(0x2000, 0x0); // 2 pages
        a.allocate_multiple_pages(2).unwrap();
        assert!(a.no_available_paddrs());

        let err = a.allocate_page().unwrap_err();
        assert!(matches!(err, VmError::OutOfDeviceMemory { .. }));
    }

    #[test]
    fn test_oversized_request_is_an_error() {
        let mut a = allocator(0x2000, 0x0);
        assert!(a.allocate_multiple_pages(4).is_err());
    }

    #[test]
    fn test_last_page_storage() {
        // Storage of exactly one page: level 0 is the only level, and
        // freeing must not try to merge past it.
        let mut a = allocator(0x1000, 0x4000);
        let p = a.allocate_page().unwrap();
        assert_eq!(p, 0x4000);
        assert!(a.no_available_paddrs());
        a.add_single_paddr(p).unwrap();
        assert_eq!(a.free_blocks_at(0), vec![0x4000]);
    }

    #[test]
    fn test_untracked_free_is_an_error() {
        let mut a = allocator(0x2000, 0x0);
        assert!(matches!(
            a.add_single_paddr(0x1000),
            Err(VmError::UntrackedFree { .. })
        ));
    }

    #[test]
    fn test_live_allocations_stay_disjoint() {
        let mut a = allocator(0x10000, 0x0); // 16 pages
        let r1 = a.allocate_multiple_pages(4).unwrap();
        let r2 = a.allocate_multiple_pages(2).unwrap();
        for p in &r1 {
            a.add_single_paddr(*p).unwrap();
        }
        let r3 = a.allocate_multiple_pages(4).unwrap();
        for p in &r3 {
            assert!(!r2.contains(p), "live runs must not overlap");
        }
    }
}
