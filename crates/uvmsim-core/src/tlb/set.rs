//! One associative set of cached translations
//!
//! Eviction order is LRU: every touch stamps the way with a monotonically
//! increasing visit counter, and a balanced tree keyed by that counter
//! yields the oldest way first.

use std::collections::BTreeMap;

use crate::error::{Result, VmError};
use crate::page::{Page, Pid};

/// A set of `num_ways` cached translations with LRU eviction
#[derive(Debug)]
pub struct Set {
    blocks: Vec<Option<Page>>,
    visit_count: u64,
    // visit stamp -> way, oldest first
    by_visit: BTreeMap<u64, usize>,
    way_stamp: Vec<u64>,
}

impl Set {
    /// Create a set with `num_ways` ways, all initially empty
    pub fn new(num_ways: usize) -> Self {
        Self {
            blocks: vec![None; num_ways],
            visit_count: num_ways as u64,
            // Seed stamps 0..num_ways so empty ways evict first.
            by_visit: (0..num_ways).map(|w| (w as u64, w)).collect(),
            way_stamp: (0..num_ways as u64).collect(),
        }
    }

    /// Find the way caching `(pid, v_addr)`
    pub fn lookup(&self, pid: Pid, v_addr: u64) -> Option<(usize, Page)> {
        self.blocks.iter().enumerate().find_map(|(way, block)| {
            block
                .as_ref()
                .filter(|page| page.pid == pid && page.v_addr == v_addr)
                .map(|page| (way, *page))
        })
    }

    /// Replace the page cached in `way`
    pub fn update(&mut self, way: usize, page: Page) {
        self.blocks[way] = Some(page);
    }

    /// Stamp `way` as most recently used
    pub fn visit(&mut self, way: usize) {
        self.by_visit.remove(&self.way_stamp[way]);
        self.visit_count += 1;
        self.way_stamp[way] = self.visit_count;
        self.by_visit.insert(self.visit_count, way);
    }

    /// Pick the least recently used way for replacement
    pub fn evict(&self) -> Result<usize> {
        self.by_visit
            .values()
            .next()
            .copied()
            .ok_or(VmError::EvictFromEmptySet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(pid: u32, v_addr: u64) -> Page {
        Page {
            pid: Pid(pid),
            v_addr,
            valid: true,
            page_size: 4096,
            ..Default::default()
        }
    }

    #[test]
    fn test_lookup_matches_pid_and_addr() {
        let mut set = Set::new(2);
        set.update(0, page(1, 0x1000));
        assert!(set.lookup(Pid(1), 0x1000).is_some());
        assert!(set.lookup(Pid(2), 0x1000).is_none());
        assert!(set.lookup(Pid(1), 0x2000).is_none());
    }

    #[test]
    fn test_evict_prefers_empty_then_lru() {
        let mut set = Set::new(2);
        assert_eq!(set.evict().unwrap(), 0);

        set.update(0, page(1, 0x1000));
        set.visit(0);
        // Way 1 is still empty, so it goes first.
        assert_eq!(set.evict().unwrap(), 1);

        set.update(1, page(1, 0x2000));
        set.visit(1);
        // Both full: way 0 is the older visit.
        assert_eq!(set.evict().unwrap(), 0);

        set.visit(0);
        assert_eq!(set.evict().unwrap(), 1);
    }

    #[test]
    fn test_empty_set_cannot_evict() {
        let set = Set::new(0);
        assert_eq!(set.evict().unwrap_err(), VmError::EvictFromEmptySet);
    }
}
