//! Miss-status holding registers
//!
//! Each entry tracks one in-flight fetch keyed by `(pid, v_addr)` together
//! with the requests waiting on it, in arrival order. Capacity bounds the
//! number of outstanding misses; a full table back-pressures the lookup
//! stage.

use std::collections::{HashMap, VecDeque};

use crate::page::{Page, Pid};
use crate::proto::{MsgId, TranslationReq};

/// One in-flight miss and its waiters
#[derive(Debug)]
pub struct MshrEntry {
    /// Owning process of the missing page
    pub pid: Pid,
    /// Aligned virtual address being fetched
    pub v_addr: u64,
    /// Id of the fetch request sent downstream
    pub req_to_bottom: MsgId,
    /// Requests waiting for the fetch, FIFO
    pub requests: VecDeque<TranslationReq>,
    /// Filled in when the fetch completes
    pub page: Option<Page>,
}

/// Capacity-bounded table of in-flight misses
#[derive(Debug)]
pub struct Mshr {
    capacity: usize,
    entries: HashMap<(Pid, u64), MshrEntry>,
}

impl Mshr {
    /// Create a table tracking at most `capacity` misses
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
        }
    }

    /// Whether no further miss can be tracked
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// The in-flight entry for `(pid, v_addr)`, if any
    pub fn query(&mut self, pid: Pid, v_addr: u64) -> Option<&mut MshrEntry> {
        self.entries.get_mut(&(pid, v_addr))
    }

    /// Whether an entry exists for `(pid, v_addr)`
    pub fn is_entry_present(&self, pid: Pid, v_addr: u64) -> bool {
        self.entries.contains_key(&(pid, v_addr))
    }

    /// Track a new miss. The caller must have checked `is_full`.
    pub fn add(&mut self, pid: Pid, v_addr: u64, req_to_bottom: MsgId) -> &mut MshrEntry {
        self.entries.entry((pid, v_addr)).or_insert(MshrEntry {
            pid,
            v_addr,
            req_to_bottom,
            requests: VecDeque::new(),
            page: None,
        })
    }

    /// Stop tracking and take the entry for `(pid, v_addr)`
    pub fn remove(&mut self, pid: Pid, v_addr: u64) -> Option<MshrEntry> {
        self.entries.remove(&(pid, v_addr))
    }

    /// Drop every entry (flush)
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}
