//! Process-scoped page tables
//!
//! The page table is the single source of truth for where a virtual page
//! currently lives. One sub-table exists per process, each behind its own
//! lock so that readers of one process never contend with writers of
//! another.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, VmError};
use crate::page::{align_to_page, Page, Pid};

/// Map from aligned virtual address to `Page`, one per process
pub struct PageTable {
    log2_page_size: u64,
    tables: Mutex<HashMap<Pid, Arc<ProcessTable>>>,
}

struct ProcessTable {
    entries: RwLock<HashMap<u64, Page>>,
}

impl PageTable {
    /// Create a page table for the given page granularity
    pub fn new(log2_page_size: u64) -> Self {
        Self {
            log2_page_size,
            tables: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self, pid: Pid) -> Arc<ProcessTable> {
        let mut tables = self.tables.lock();
        Arc::clone(tables.entry(pid).or_insert_with(|| {
            Arc::new(ProcessTable {
                entries: RwLock::new(HashMap::new()),
            })
        }))
    }

    /// Insert a new page. Fails if `(pid, v_addr)` is already mapped.
    pub fn insert(&self, page: Page) -> Result<()> {
        let table = self.table(page.pid);
        let mut entries = table.entries.write();
        if entries.contains_key(&page.v_addr) {
            return Err(VmError::PageAlreadyExists {
                pid: page.pid,
                v_addr: page.v_addr,
            });
        }
        entries.insert(page.v_addr, page);
        Ok(())
    }

    /// Remove the entry at `(pid, v_addr)`. Fails if absent.
    pub fn remove(&self, pid: Pid, v_addr: u64) -> Result<()> {
        let table = self.table(pid);
        let mut entries = table.entries.write();
        entries
            .remove(&v_addr)
            .map(|_| ())
            .ok_or(VmError::PageNotFound { pid, v_addr })
    }

    /// Find the page containing `addr`. The address is aligned down to the
    /// page boundary before the lookup.
    pub fn find(&self, pid: Pid, addr: u64) -> Option<Page> {
        let table = self.table(pid);
        let v_addr = align_to_page(addr, self.log2_page_size);
        let entries = table.entries.read();
        entries.get(&v_addr).copied()
    }

    /// Replace the full record keyed by `(pid, v_addr)`. Fails if absent.
    pub fn update(&self, page: Page) -> Result<()> {
        let table = self.table(page.pid);
        let mut entries = table.entries.write();
        match entries.get_mut(&page.v_addr) {
            Some(entry) => {
                *entry = page;
                Ok(())
            }
            None => Err(VmError::PageNotFound {
                pid: page.pid,
                v_addr: page.v_addr,
            }),
        }
    }

    /// Drop every entry owned by `pid` (process teardown).
    pub fn remove_process(&self, pid: Pid) {
        self.tables.lock().remove(&pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(pid: u32, v_addr: u64) -> Page {
        Page {
            pid: Pid(pid),
            v_addr,
            p_addr: 0x10_0000 + v_addr,
            page_size: 4096,
            valid: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_and_find() {
        let pt = PageTable::new(12);
        pt.insert(page(1, 0x1000)).unwrap();

        let found = pt.find(Pid(1), 0x1000).unwrap();
        assert_eq!(found.p_addr, 0x10_1000);

        // Offsets within the page resolve to the same entry.
        let found = pt.find(Pid(1), 0x1fff).unwrap();
        assert_eq!(found.v_addr, 0x1000);
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let pt = PageTable::new(12);
        pt.insert(page(1, 0x1000)).unwrap();
        let err = pt.insert(page(1, 0x1000)).unwrap_err();
        assert_eq!(
            err,
            VmError::PageAlreadyExists {
                pid: Pid(1),
                v_addr: 0x1000
            }
        );
    }

    #[test]
    fn test_pids_are_isolated() {
        let pt = PageTable::new(12);
        pt.insert(page(1, 0x1000)).unwrap();
        assert!(pt.find(Pid(2), 0x1000).is_none());
        pt.insert(page(2, 0x1000)).unwrap();
    }

    #[test]
    fn test_remove() {
        let pt = PageTable::new(12);
        pt.insert(page(1, 0x1000)).unwrap();
        pt.remove(Pid(1), 0x1000).unwrap();
        assert!(pt.find(Pid(1), 0x1000).is_none());
        assert!(pt.remove(Pid(1), 0x1000).is_err());
    }

    #[test]
    fn test_update() {
        let pt = PageTable::new(12);
        assert!(pt.update(page(1, 0x1000)).is_err());

        pt.insert(page(1, 0x1000)).unwrap();
        let mut p = page(1, 0x1000);
        p.is_pinned = true;
        pt.update(p).unwrap();
        assert!(pt.find(Pid(1), 0x1000).unwrap().is_pinned);
    }
}
