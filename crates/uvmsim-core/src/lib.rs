//! # uvmsim-core
//!
//! Virtual-memory core of a multi-device accelerator simulator: page
//! tables, buddy-allocated device memories, set-associative TLBs, a page
//! walker, and a migration coordinator that moves unified pages between
//! devices on demand.
//!
//! ## Components
//!
//! - **Page table**: per-process virtual-to-physical mappings
//! - **Allocator**: buddy allocation over stacked device address ranges
//! - **TLB**: translation caching with miss coalescing and flush/restart
//! - **MMU**: fixed-latency page walks and migration arbitration
//! - **Coordinator**: drain, shoot down, copy, restart, then respond
//!
//! Components are wired through bounded message ports and advanced by an
//! external driver calling [`Tick::tick`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod buddy;
pub mod config;
pub mod error;
pub mod migration;
pub mod mmu;
pub mod page;
pub mod page_table;
pub mod port;
pub mod proto;
pub mod tlb;

// Re-exports
pub use alloc::MemoryAllocator;
pub use buddy::BuddyAllocator;
pub use config::{CoordinatorConfig, DeviceConfig, MmuConfig, TlbConfig};
pub use error::{Result, VmError};
pub use migration::{CoordinatorStats, MigrationCoordinator};
pub use mmu::{Mmu, MmuStats};
pub use page::{DeviceId, Page, Pid};
pub use page_table::PageTable;
pub use port::{Port, Tick};
pub use tlb::{Tlb, TlbStats};

#[cfg(test)]
mod tests {
    #[test]
    fn test_version() {
        assert_eq!(env!("CARGO_PKG_VERSION"), "0.1.0");
    }
}
