//! Page migration coordinator
//!
//! Drives one migration at a time through four phases, each gated on
//! acknowledgements from the devices it commanded:
//!
//! 1. drain the transport engines of every device
//! 2. shoot down cached translations on the devices that accessed the page
//! 3. re-home the pages and issue the physical copies
//! 4. restart transport everywhere and compute on the accessing devices
//!
//! Only then is the requesting MMU answered. Commands go through an
//! outbox so a full device port delays delivery without duplicating it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};

use crate::alloc::MemoryAllocator;
use crate::config::CoordinatorConfig;
use crate::error::{Result, VmError};
use crate::page::{align_to_page, DeviceId};
use crate::port::{Port, Tick};
use crate::proto::{
    DeviceCmd, DeviceRsp, MsgId, PageCopyCmd, PageMigrationReqToDriver, PageMigrationRspFromDriver,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Drain,
    Shootdown,
    Copy,
    Restart,
    Respond,
}

struct Ongoing {
    req: PageMigrationReqToDriver,
    migrated_vaddrs: Vec<u64>,
    phase: Phase,
    pending_acks: usize,
}

/// Migration counters
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorStats {
    /// Migrations run to completion
    pub migrations_completed: u64,
    /// Pages physically copied
    pub pages_copied: u64,
    /// Shootdown commands issued
    pub shootdowns_sent: u64,
}

/// Sequences drain, shootdown, copy, and restart for page migrations
pub struct MigrationCoordinator {
    config: CoordinatorConfig,
    allocator: Arc<MemoryAllocator>,

    device_ports: BTreeMap<DeviceId, Port<DeviceCmd>>,
    req_in: Port<PageMigrationReqToDriver>,
    ack_in: Port<DeviceRsp>,
    outbox: VecDeque<(Port<DeviceCmd>, DeviceCmd)>,

    ongoing: Option<Ongoing>,
    stats: CoordinatorStats,
}

impl MigrationCoordinator {
    /// Create a coordinator over the given allocator
    pub fn new(config: CoordinatorConfig, allocator: Arc<MemoryAllocator>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            allocator,
            device_ports: BTreeMap::new(),
            req_in: Port::new(config.port_capacity),
            ack_in: Port::new(config.port_capacity),
            outbox: VecDeque::new(),
            ongoing: None,
            stats: CoordinatorStats::default(),
            config,
        })
    }

    /// Register the command port of a device
    pub fn register_device(&mut self, device_id: DeviceId, port: Port<DeviceCmd>) {
        self.device_ports.insert(device_id, port);
    }

    /// Port MMUs send migration requests to
    pub fn req_port(&self) -> Port<PageMigrationReqToDriver> {
        self.req_in.clone()
    }

    /// Port devices acknowledge commands on
    pub fn ack_port(&self) -> Port<DeviceRsp> {
        self.ack_in.clone()
    }

    /// Counter snapshot
    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    fn port_of(&self, device_id: DeviceId) -> Result<Port<DeviceCmd>> {
        self.device_ports
            .get(&device_id)
            .cloned()
            .ok_or(VmError::UnknownDevice(device_id))
    }

    /// Accessing devices that are actually registered, deduplicated
    fn accessing_devices(req: &PageMigrationReqToDriver) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = Vec::new();
        for &d in &req.current_accessing_devices {
            if !devices.contains(&d) {
                devices.push(d);
            }
        }
        devices
    }

    fn flush_outbox(&mut self) -> bool {
        let mut progress = false;
        while let Some((port, cmd)) = self.outbox.front() {
            if port.send(cmd.clone()).is_err() {
                break;
            }
            self.outbox.pop_front();
            progress = true;
        }
        progress
    }

    fn collect_acks(&mut self) -> bool {
        let mut progress = false;
        while let Some(_ack) = self.ack_in.retrieve() {
            if let Some(ongoing) = &mut self.ongoing {
                ongoing.pending_acks = ongoing.pending_acks.saturating_sub(1);
            }
            progress = true;
        }
        progress
    }

    fn queue_drain(&mut self) -> usize {
        let mut issued = 0;
        for port in self.device_ports.values() {
            self.outbox
                .push_back((port.clone(), DeviceCmd::DrainTransport { id: MsgId::next() }));
            issued += 1;
        }
        issued
    }

    fn queue_shootdown(&mut self, req: &PageMigrationReqToDriver) -> Result<usize> {
        let v_addrs: Vec<u64> = req
            .device_to_vaddrs
            .values()
            .flatten()
            .map(|&v| align_to_page(v, self.config.log2_page_size))
            .collect();
        let mut issued = 0;
        for device_id in Self::accessing_devices(req) {
            let port = self.port_of(device_id)?;
            self.outbox.push_back((
                port,
                DeviceCmd::Shootdown {
                    id: MsgId::next(),
                    pid: req.pid,
                    v_addrs: v_addrs.clone(),
                },
            ));
            issued += 1;
            self.stats.shootdowns_sent += 1;
        }
        Ok(issued)
    }

    /// Re-home each faulted page and issue its physical copy
    fn queue_copies(&mut self, req: &PageMigrationReqToDriver) -> Result<(usize, Vec<u64>)> {
        let mut issued = 0;
        let mut migrated = Vec::new();

        for (&dst_device, v_addrs) in &req.device_to_vaddrs {
            let port = self.port_of(dst_device)?;
            for &v_addr in v_addrs {
                let v_addr = align_to_page(v_addr, self.config.log2_page_size);
                let old = self.allocator.release_physical(req.pid, v_addr)?;
                let new = self.allocator.allocate_page_with_given_vaddr(
                    req.pid,
                    dst_device,
                    v_addr,
                    old.unified,
                )?;

                self.outbox.push_back((
                    port.clone(),
                    DeviceCmd::CopyPage(PageCopyCmd {
                        id: MsgId::next(),
                        src_p_addr: old.p_addr,
                        dst_p_addr: new.p_addr,
                        page_size: old.page_size,
                        dst_device,
                    }),
                ));
                migrated.push(v_addr);
                issued += 1;
                self.stats.pages_copied += 1;
                debug!(
                    v_addr = format_args!("{:#x}", v_addr),
                    from = old.device_id,
                    to = dst_device,
                    "page re-homed"
                );
            }
        }
        Ok((issued, migrated))
    }

    fn queue_restart(&mut self, req: &PageMigrationReqToDriver) -> Result<usize> {
        let mut issued = 0;
        for port in self.device_ports.values() {
            self.outbox
                .push_back((port.clone(), DeviceCmd::RestartTransport { id: MsgId::next() }));
            issued += 1;
        }
        for device_id in Self::accessing_devices(req) {
            let port = self.port_of(device_id)?;
            self.outbox
                .push_back((port, DeviceCmd::RestartCompute { id: MsgId::next() }));
            issued += 1;
        }
        Ok(issued)
    }

    /// Move a fully acknowledged migration into its next phase
    fn advance(&mut self) -> Result<bool> {
        let Some(ongoing) = &self.ongoing else {
            return Ok(false);
        };
        if ongoing.pending_acks > 0 || !self.outbox.is_empty() {
            return Ok(false);
        }

        let phase = ongoing.phase;
        let req = ongoing.req.clone();
        let mut next = (Phase::Respond, 0);
        let mut migrated = None;

        match phase {
            Phase::Drain => next = (Phase::Shootdown, self.queue_shootdown(&req)?),
            Phase::Shootdown => {
                let (pending, v_addrs) = self.queue_copies(&req)?;
                next = (Phase::Copy, pending);
                migrated = Some(v_addrs);
            }
            Phase::Copy => next = (Phase::Restart, self.queue_restart(&req)?),
            Phase::Restart => {}
            Phase::Respond => {
                let rsp = PageMigrationRspFromDriver {
                    respond_to: req.id,
                    v_addrs: ongoing.migrated_vaddrs.clone(),
                    respond_to_top: req.respond_to_top,
                };
                if req.reply_to.send(rsp).is_err() {
                    return Ok(false);
                }
                self.ongoing = None;
                self.stats.migrations_completed += 1;
                info!(pid = req.pid.raw(), "migration completed");
                return Ok(true);
            }
        }

        if let Some(ongoing) = self.ongoing.as_mut() {
            ongoing.phase = next.0;
            ongoing.pending_acks = next.1;
            if let Some(v_addrs) = migrated {
                ongoing.migrated_vaddrs = v_addrs;
            }
        }
        Ok(true)
    }

    /// Start the next migration when idle
    fn accept(&mut self) -> Result<bool> {
        if self.ongoing.is_some() {
            return Ok(false);
        }
        let Some(req) = self.req_in.retrieve() else {
            return Ok(false);
        };
        debug!(
            pid = req.pid.raw(),
            host = req.current_host_device,
            "migration accepted"
        );
        let pending = self.queue_drain();
        self.ongoing = Some(Ongoing {
            req,
            migrated_vaddrs: Vec::new(),
            phase: Phase::Drain,
            pending_acks: pending,
        });
        Ok(true)
    }
}

impl Tick for MigrationCoordinator {
    fn tick(&mut self) -> Result<bool> {
        let mut progress = self.collect_acks();
        progress |= self.advance()?;
        progress |= self.flush_outbox();
        progress |= self.accept()?;
        Ok(progress)
    }
}
