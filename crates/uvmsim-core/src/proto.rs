//! Boundary messages between components
//!
//! Each channel carries a closed set of message kinds, so every component
//! matches exhaustively over what can reach it. Requests embed the port
//! their response should be sent to; responses carry the id of the request
//! they answer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::page::{DeviceId, Page, Pid};
use crate::port::Port;

/// Correlation id for request/response pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MsgId(pub u64);

impl MsgId {
    /// Allocate the next process-wide unique id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        MsgId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Ask the receiver to translate a virtual address
#[derive(Debug, Clone)]
pub struct TranslationReq {
    /// Correlation id
    pub id: MsgId,
    /// Virtual address to translate (any offset within the page)
    pub v_addr: u64,
    /// Owning process
    pub pid: Pid,
    /// Device issuing the access
    pub device_id: DeviceId,
    /// Where the `TranslationRsp` must be delivered
    pub reply_to: Port<TranslationRsp>,
}

impl TranslationReq {
    /// Build a request with a fresh correlation id
    pub fn new(pid: Pid, v_addr: u64, device_id: DeviceId, reply_to: Port<TranslationRsp>) -> Self {
        Self {
            id: MsgId::next(),
            v_addr,
            pid,
            device_id,
            reply_to,
        }
    }
}

/// Answer to a `TranslationReq`, carrying the resolved page
#[derive(Debug, Clone)]
pub struct TranslationRsp {
    /// Id of the request this answers
    pub respond_to: MsgId,
    /// The resolved translation
    pub page: Page,
}

/// Control requests into a TLB, serviced before any data traffic
#[derive(Debug, Clone)]
pub enum TlbCtrlReq {
    /// Invalidate the named entries, reset MSHR state, and pause
    Flush {
        /// Correlation id
        id: MsgId,
        /// Owning process of the flushed entries
        pid: Pid,
        /// Aligned virtual addresses to invalidate
        v_addrs: Vec<u64>,
        /// Where the acknowledgement goes
        reply_to: Port<TlbCtrlRsp>,
    },
    /// Resume operation, discarding requests that arrived while paused
    Restart {
        /// Correlation id
        id: MsgId,
        /// Where the acknowledgement goes
        reply_to: Port<TlbCtrlRsp>,
    },
}

/// Acknowledgement for a TLB control request
#[derive(Debug, Clone)]
pub enum TlbCtrlRsp {
    /// The flush has been applied and the TLB is paused
    FlushDone {
        /// Id of the flush request
        respond_to: MsgId,
    },
    /// The TLB has resumed
    RestartDone {
        /// Id of the restart request
        respond_to: MsgId,
    },
}

/// Request from the MMU asking the driver to relocate a page
#[derive(Debug, Clone)]
pub struct PageMigrationReqToDriver {
    /// Correlation id
    pub id: MsgId,
    /// Owning process
    pub pid: Pid,
    /// Page size in bytes
    pub page_size: u64,
    /// Device currently hosting the page
    pub current_host_device: DeviceId,
    /// Devices that have accessed the page, deduplicated
    pub current_accessing_devices: Vec<DeviceId>,
    /// Requesting device to the virtual addresses it faulted on
    pub device_to_vaddrs: HashMap<DeviceId, Vec<u64>>,
    /// Whether the completion should also notify the top-level requester
    pub respond_to_top: bool,
    /// Where the completion response goes
    pub reply_to: Port<PageMigrationRspFromDriver>,
}

/// Completion response for a page migration
#[derive(Debug, Clone)]
pub struct PageMigrationRspFromDriver {
    /// Id of the migration request
    pub respond_to: MsgId,
    /// Virtual addresses whose migration is now complete
    pub v_addrs: Vec<u64>,
    /// Mirror of the request's respond-to-top flag
    pub respond_to_top: bool,
}

/// Physical-to-physical copy of one page
#[derive(Debug, Clone)]
pub struct PageCopyCmd {
    /// Correlation id
    pub id: MsgId,
    /// Source physical address on the old host device
    pub src_p_addr: u64,
    /// Destination physical address on the new host device
    pub dst_p_addr: u64,
    /// Bytes to copy
    pub page_size: u64,
    /// Device receiving the data
    pub dst_device: DeviceId,
}

/// Commands the migration coordinator issues to a device
#[derive(Debug, Clone)]
pub enum DeviceCmd {
    /// Quiesce the device's transport engines
    DrainTransport {
        /// Correlation id
        id: MsgId,
    },
    /// Invalidate cached translations for the named pages
    Shootdown {
        /// Correlation id
        id: MsgId,
        /// Owning process
        pid: Pid,
        /// Aligned virtual addresses to purge
        v_addrs: Vec<u64>,
    },
    /// Copy a page into this device's memory
    CopyPage(PageCopyCmd),
    /// Re-enable the device's transport engines
    RestartTransport {
        /// Correlation id
        id: MsgId,
    },
    /// Resume the device's compute units
    RestartCompute {
        /// Correlation id
        id: MsgId,
    },
}

impl DeviceCmd {
    /// Correlation id of the command
    pub fn id(&self) -> MsgId {
        match self {
            DeviceCmd::DrainTransport { id }
            | DeviceCmd::Shootdown { id, .. }
            | DeviceCmd::RestartTransport { id }
            | DeviceCmd::RestartCompute { id } => *id,
            DeviceCmd::CopyPage(cmd) => cmd.id,
        }
    }
}

/// Acknowledgement for a `DeviceCmd`
#[derive(Debug, Clone)]
pub struct DeviceRsp {
    /// Id of the acknowledged command
    pub respond_to: MsgId,
    /// Device that acknowledged
    pub device_id: DeviceId,
}
