//! Device-level memory allocation
//!
//! The `MemoryAllocator` sits above the per-device buddy allocators: it
//! owns the device registry, hands out virtual address ranges per process,
//! and keeps the page table in sync with every physical allocation. Each
//! registered device's physical range is stacked after the previous one,
//! so a physical address identifies its device by range lookup.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::buddy::BuddyAllocator;
use crate::config::DeviceConfig;
use crate::error::{Result, VmError};
use crate::page::{pages_for_bytes, DeviceId, Page, Pid};
use crate::page_table::PageTable;

/// Virtual address cursor for one process
struct ProcessMemoryState {
    next_v_addr: u64,
}

struct AllocatorState {
    devices: BTreeMap<DeviceId, BuddyAllocator>,
    process_states: HashMap<Pid, ProcessMemoryState>,
    // Grows as devices register; starts at one page to avoid address 0.
    total_storage: u64,
}

/// Allocator for memory across every registered device
pub struct MemoryAllocator {
    page_table: Arc<PageTable>,
    log2_page_size: u64,
    state: Mutex<AllocatorState>,
}

impl MemoryAllocator {
    /// Create an allocator backed by the shared page table
    pub fn new(page_table: Arc<PageTable>, log2_page_size: u64) -> Self {
        Self {
            page_table,
            log2_page_size,
            state: Mutex::new(AllocatorState {
                devices: BTreeMap::new(),
                process_states: HashMap::new(),
                total_storage: 1 << log2_page_size,
            }),
        }
    }

    fn page_size(&self) -> u64 {
        1 << self.log2_page_size
    }

    /// Register a device's physical memory, placed directly after all
    /// previously registered storage
    pub fn register_device(&self, device_id: DeviceId, config: DeviceConfig) -> Result<()> {
        config.validate()?;
        let storage_size = config.storage_size;
        let mut state = self.state.lock();
        let base = state.total_storage;

        let mut mem = BuddyAllocator::new(device_id, self.log2_page_size);
        mem.set_storage_size(storage_size);
        mem.set_initial_address(base);

        state.total_storage += storage_size;
        state.devices.insert(device_id, mem);
        debug!(device_id, base = format_args!("{base:#x}"), storage_size, "registered device");
        Ok(())
    }

    /// Device whose physical range contains `p_addr`
    pub fn device_id_by_paddr(&self, p_addr: u64) -> Result<DeviceId> {
        let state = self.state.lock();
        state
            .devices
            .iter()
            .find(|(_, mem)| {
                p_addr >= mem.initial_address()
                    && p_addr < mem.initial_address() + mem.storage_size()
            })
            .map(|(&id, _)| id)
            .ok_or(VmError::DeviceNotFound { p_addr })
    }

    /// Allocate `byte_size` bytes for `pid` on one device, returning the
    /// first virtual address of the new range
    pub fn allocate(&self, pid: Pid, byte_size: u64, device_id: DeviceId) -> Result<u64> {
        if byte_size == 0 {
            return Err(VmError::ZeroSizedAllocation { pid });
        }
        let num_pages = pages_for_bytes(byte_size, self.log2_page_size);
        self.allocate_pages(num_pages as usize, pid, device_id, false)
    }

    /// Allocate unified (migration-eligible) memory, initially homed on
    /// the first device
    pub fn allocate_unified(&self, pid: Pid, byte_size: u64) -> Result<u64> {
        if byte_size == 0 {
            return Err(VmError::ZeroSizedAllocation { pid });
        }
        let num_pages = pages_for_bytes(byte_size, self.log2_page_size);
        self.allocate_pages(num_pages as usize, pid, 1, true)
    }

    fn allocate_pages(
        &self,
        num_pages: usize,
        pid: Pid,
        device_id: DeviceId,
        unified: bool,
    ) -> Result<u64> {
        let page_size = self.page_size();
        let mut state = self.state.lock();

        let next_v_addr = state
            .process_states
            .entry(pid)
            .or_insert(ProcessMemoryState {
                next_v_addr: page_size,
            })
            .next_v_addr;

        let mem = state
            .devices
            .get_mut(&device_id)
            .ok_or(VmError::UnknownDevice(device_id))?;
        let p_addrs = mem.allocate_multiple_pages(num_pages)?;

        for (i, &p_addr) in p_addrs.iter().enumerate() {
            let page = Page {
                pid,
                v_addr: next_v_addr + i as u64 * page_size,
                p_addr,
                page_size,
                valid: true,
                device_id,
                unified,
                is_migrating: false,
                is_pinned: false,
            };
            self.page_table.insert(page)?;
        }

        if let Some(process) = state.process_states.get_mut(&pid) {
            process.next_v_addr += page_size * num_pages as u64;
        }

        Ok(next_v_addr)
    }

    /// Allocate a physical page on `device_id` for an already-mapped
    /// virtual address, rewriting the existing page-table entry in place.
    /// This is the re-homing step of a migration.
    pub fn allocate_page_with_given_vaddr(
        &self,
        pid: Pid,
        device_id: DeviceId,
        v_addr: u64,
        unified: bool,
    ) -> Result<Page> {
        let page_size = self.page_size();
        let mut state = self.state.lock();
        let mem = state
            .devices
            .get_mut(&device_id)
            .ok_or(VmError::UnknownDevice(device_id))?;
        let p_addr = mem.allocate_page()?;

        let page = Page {
            pid,
            v_addr,
            p_addr,
            page_size,
            valid: true,
            device_id,
            unified,
            is_migrating: false,
            is_pinned: false,
        };
        self.page_table.update(page)?;
        Ok(page)
    }

    /// Return a mapped page's physical memory to its device without
    /// touching the page-table entry
    pub fn release_physical(&self, pid: Pid, v_addr: u64) -> Result<Page> {
        let page = self
            .page_table
            .find(pid, v_addr)
            .ok_or(VmError::PageNotFound { pid, v_addr })?;

        let device_id = self.device_id_by_paddr(page.p_addr)?;
        let mut state = self.state.lock();
        state
            .devices
            .get_mut(&device_id)
            .ok_or(VmError::UnknownDevice(device_id))?
            .add_single_paddr(page.p_addr)?;
        Ok(page)
    }

    /// Unmap one page: free its physical memory and drop the page-table
    /// entry
    pub fn remove_page(&self, pid: Pid, v_addr: u64) -> Result<()> {
        let page = self.release_physical(pid, v_addr)?;
        self.page_table.remove(page.pid, page.v_addr)
    }

    /// Free the allocation starting at `v_addr`
    pub fn free(&self, pid: Pid, v_addr: u64) -> Result<()> {
        self.remove_page(pid, v_addr)
    }

    /// Whether `device_id` has run out of physical pages
    pub fn device_exhausted(&self, device_id: DeviceId) -> Result<bool> {
        let state = self.state.lock();
        state
            .devices
            .get(&device_id)
            .map(|mem| mem.no_available_paddrs())
            .ok_or(VmError::UnknownDevice(device_id))
    }

    /// Ids of every registered device, in registration-range order
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.state.lock().devices.keys().copied().collect()
    }

    /// The shared page table
    pub fn page_table(&self) -> &Arc<PageTable> {
        &self.page_table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(storage_size: u64) -> DeviceConfig {
        DeviceConfig { storage_size }
    }

    fn setup() -> (Arc<PageTable>, MemoryAllocator) {
        let pt = Arc::new(PageTable::new(12));
        let alloc = MemoryAllocator::new(Arc::clone(&pt), 12);
        alloc.register_device(1, device(0x10000)).unwrap(); // 16 pages
        alloc.register_device(2, device(0x10000)).unwrap();
        (pt, alloc)
    }

    #[test]
    fn test_device_ranges_are_stacked() {
        let (_, alloc) = setup();
        // Storage starts one page in, so address 0 is never valid.
        assert_eq!(alloc.device_id_by_paddr(0x1000).unwrap(), 1);
        assert_eq!(alloc.device_id_by_paddr(0x11000).unwrap(), 2);
        assert!(alloc.device_id_by_paddr(0x21000).is_err());
    }

    #[test]
    fn test_allocate_maps_pages() {
        let (pt, alloc) = setup();
        let v_addr = alloc.allocate(Pid(1), 2 * 4096, 2).unwrap();
        assert_eq!(v_addr, 0x1000); // vaddr space also skips page 0

        let page = pt.find(Pid(1), v_addr).unwrap();
        assert_eq!(page.device_id, 2);
        assert!(page.valid);
        assert!(!page.unified);
        assert!(pt.find(Pid(1), v_addr + 0x1000).is_some());

        // The next allocation continues the process's vaddr space.
        let next = alloc.allocate(Pid(1), 4096, 1).unwrap();
        assert_eq!(next, 0x3000);
    }

    #[test]
    fn test_allocate_unified_homes_on_first_device() {
        let (pt, alloc) = setup();
        let v_addr = alloc.allocate_unified(Pid(3), 4096).unwrap();
        let page = pt.find(Pid(3), v_addr).unwrap();
        assert!(page.unified);
        assert_eq!(page.device_id, 1);
    }

    #[test]
    fn test_free_round_trip() {
        let (pt, alloc) = setup();
        for _ in 0..2 {
            let v_addr = alloc.allocate(Pid(1), 16 * 4096, 1).unwrap();
            assert!(alloc.device_exhausted(1).unwrap());
            for i in 0..16 {
                alloc.free(Pid(1), v_addr + i * 4096).unwrap();
            }
            assert!(!alloc.device_exhausted(1).unwrap());
            assert!(pt.find(Pid(1), v_addr).is_none());
        }
    }

    #[test]
    fn test_rehoming_keeps_entry_alive() {
        let (pt, alloc) = setup();
        let v_addr = alloc.allocate_unified(Pid(1), 4096).unwrap();
        let old = alloc.release_physical(Pid(1), v_addr).unwrap();

        let new = alloc
            .allocate_page_with_given_vaddr(Pid(1), 2, v_addr, true)
            .unwrap();
        assert_eq!(new.device_id, 2);
        assert_ne!(new.p_addr, old.p_addr);
        assert_eq!(pt.find(Pid(1), v_addr).unwrap(), new);
    }

    #[test]
    fn test_zero_byte_allocation_is_an_error() {
        let (pt, alloc) = setup();
        assert_eq!(
            alloc.allocate(Pid(1), 0, 1).unwrap_err(),
            VmError::ZeroSizedAllocation { pid: Pid(1) }
        );
        assert_eq!(
            alloc.allocate_unified(Pid(1), 0).unwrap_err(),
            VmError::ZeroSizedAllocation { pid: Pid(1) }
        );
        // A later real allocation still starts at the first vaddr.
        let v_addr = alloc.allocate(Pid(1), 4096, 1).unwrap();
        assert_eq!(v_addr, 0x1000);
        assert!(pt.find(Pid(1), v_addr).is_some());
    }

    #[test]
    fn test_exhaustion_propagates() {
        let (_, alloc) = setup();
        let err = alloc.allocate(Pid(1), 32 * 4096, 1).unwrap_err();
        assert!(matches!(err, VmError::OutOfDeviceMemory { .. }));
    }
}
