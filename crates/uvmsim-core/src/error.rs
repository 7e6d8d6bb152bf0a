//! Error types for the unified memory core
//!
//! Conditions here are modeling bugs, not transient resource limits:
//! back-pressure (full ports, full MSHR, busy migration slot) is expressed
//! as "no progress" on a tick and never as an error.

use thiserror::Error;

use crate::page::{DeviceId, Pid};

/// Result type alias for unified memory operations
pub type Result<T> = std::result::Result<T, VmError>;

/// Main error type for the unified memory core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// A page table entry already exists for the key
    #[error("page already mapped: pid {pid}, v_addr {v_addr:#x}")]
    PageAlreadyExists {
        /// Owning process
        pid: Pid,
        /// Aligned virtual address
        v_addr: u64,
    },

    /// No page table entry for the key
    #[error("page not mapped: pid {pid}, v_addr {v_addr:#x}")]
    PageNotFound {
        /// Owning process
        pid: Pid,
        /// Aligned virtual address
        v_addr: u64,
    },

    /// A physical address does not fall in any registered device range
    #[error("no device owns physical address {p_addr:#x}")]
    DeviceNotFound {
        /// The orphan physical address
        p_addr: u64,
    },

    /// A device id was never registered
    #[error("device {0} is not registered")]
    UnknownDevice(DeviceId),

    /// The buddy tree has no free block large enough
    #[error("device {device_id} out of memory: no free block for {num_pages} pages")]
    OutOfDeviceMemory {
        /// Device whose storage is exhausted
        device_id: DeviceId,
        /// Pages requested
        num_pages: usize,
    },

    /// A freed address has no live allocation run
    #[error("free of untracked physical address {p_addr:#x} on device {device_id}")]
    UntrackedFree {
        /// Device the address belongs to
        device_id: DeviceId,
        /// The address being freed
        p_addr: u64,
    },

    /// An allocation was requested for zero bytes
    #[error("zero-sized allocation for pid {pid}")]
    ZeroSizedAllocation {
        /// Requesting process
        pid: Pid,
    },

    /// A TLB set with zero ways cannot hold or evict entries
    #[error("cannot evict from an empty TLB set")]
    EvictFromEmptySet,

    /// Configuration validation failure
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
