//! Memory management unit
//!
//! Walks the page table with a fixed latency and arbitrates page
//! migrations for unified pages. A translation that lands on a page homed
//! on another device is parked in a migration queue; one migration is
//! dispatched to the driver at a time, and queued requests for a page
//! that has since arrived (or was pinned) are answered without another
//! round trip.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::MmuConfig;
use crate::error::{Result, VmError};
use crate::page::{align_to_page, DeviceId, Page};
use crate::page_table::PageTable;
use crate::port::{Port, Tick};
use crate::proto::{
    MsgId, PageMigrationReqToDriver, PageMigrationRspFromDriver, TranslationReq, TranslationRsp,
};

/// Progress of the single outstanding migration
enum MigrationState {
    Idle,
    /// A migration request was sent to the driver for this translation
    Dispatched { waiting: TranslationReq },
}

/// A page walk in flight
struct Transaction {
    req: TranslationReq,
    cycles_left: u32,
}

/// Walk and migration counters
#[derive(Debug, Clone, Copy, Default)]
pub struct MmuStats {
    /// Page walks answered directly
    pub walks_completed: u64,
    /// Migrations dispatched to the driver
    pub migrations_started: u64,
    /// Queued requests answered because the page had already arrived
    pub stale_migrations: u64,
}

/// Page walker with a migration queue for unified pages
pub struct Mmu {
    config: MmuConfig,
    page_table: Arc<PageTable>,

    walking: Vec<Transaction>,
    migration_queue: VecDeque<TranslationReq>,
    migration_state: MigrationState,
    page_accessed_by_device: HashMap<u64, Vec<DeviceId>>,

    top_in: Port<TranslationReq>,
    migration_done_in: Port<PageMigrationRspFromDriver>,
    migration_out: Option<Port<PageMigrationReqToDriver>>,

    stats: MmuStats,
}

impl Mmu {
    /// Create an MMU walking the given page table
    pub fn new(config: MmuConfig, page_table: Arc<PageTable>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            page_table,
            walking: Vec::new(),
            migration_queue: VecDeque::new(),
            migration_state: MigrationState::Idle,
            page_accessed_by_device: HashMap::new(),
            top_in: Port::new(config.port_capacity),
            migration_done_in: Port::new(config.port_capacity),
            migration_out: None,
            stats: MmuStats::default(),
            config,
        })
    }

    /// Port TLBs send translation requests to
    pub fn top_port(&self) -> Port<TranslationReq> {
        self.top_in.clone()
    }

    /// Wire the migration coordinator's request port
    pub fn connect_migration(&mut self, port: Port<PageMigrationReqToDriver>) {
        self.migration_out = Some(port);
    }

    /// Counter snapshot
    pub fn stats(&self) -> MmuStats {
        self.stats
    }

    fn respond(req: &TranslationReq, page: Page) -> bool {
        req.reply_to
            .send(TranslationRsp {
                respond_to: req.id,
                page,
            })
            .is_ok()
    }

    /// Accept new requests up to the in-flight limit
    fn parse_from_top(&mut self) -> bool {
        if self.walking.len() >= self.config.max_requests_in_flight {
            return false;
        }
        let Some(req) = self.top_in.retrieve() else {
            return false;
        };

        let v_addr = align_to_page(req.v_addr, self.config.log2_page_size);
        let accessors = self.page_accessed_by_device.entry(v_addr).or_default();
        if !accessors.contains(&req.device_id) {
            accessors.push(req.device_id);
        }

        self.walking.push(Transaction {
            cycles_left: self.config.page_walk_latency,
            req,
        });
        true
    }

    /// Advance walks and retire the finished ones
    fn walk_page_table(&mut self) -> Result<bool> {
        let mut progress = false;
        let mut retired = Vec::new();

        for (i, txn) in self.walking.iter().enumerate() {
            if txn.cycles_left > 0 {
                continue;
            }
            let v_addr = align_to_page(txn.req.v_addr, self.config.log2_page_size);
            let page = self
                .page_table
                .find(txn.req.pid, v_addr)
                .ok_or(VmError::PageNotFound {
                    pid: txn.req.pid,
                    v_addr,
                })?;

            if page.is_migrating {
                if self.migration_queue.len() >= self.config.migration_queue_size {
                    continue;
                }
                self.migration_queue.push_back(txn.req.clone());
                retired.push(i);
                progress = true;
                continue;
            }

            if page.unified && page.device_id != txn.req.device_id && !page.is_pinned {
                if self.migration_queue.len() >= self.config.migration_queue_size {
                    continue;
                }
                let mut marked = page;
                marked.is_migrating = true;
                self.page_table.update(marked)?;
                self.migration_queue.push_back(txn.req.clone());
                retired.push(i);
                progress = true;
                continue;
            }

            if Self::respond(&txn.req, page) {
                retired.push(i);
                self.stats.walks_completed += 1;
                progress = true;
            }
        }

        for i in retired.into_iter().rev() {
            self.walking.swap_remove(i);
        }
        for txn in &mut self.walking {
            if txn.cycles_left > 0 {
                txn.cycles_left -= 1;
                progress = true;
            }
        }
        Ok(progress)
    }

    /// Whether another queued request still refers to this physical page
    fn page_still_referenced(&self, p_addr: u64) -> bool {
        self.migration_queue.iter().any(|req| {
            let v_addr = align_to_page(req.v_addr, self.config.log2_page_size);
            self.page_table
                .find(req.pid, v_addr)
                .is_some_and(|page| page.p_addr == p_addr)
        })
    }

    /// Clear the migrating flag unless a queued request still needs it
    fn finish_migration_for(&mut self, page: Page) -> Result<()> {
        if self.page_still_referenced(page.p_addr) {
            return Ok(());
        }
        let mut cleared = page;
        cleared.is_migrating = false;
        self.page_table.update(cleared)
    }

    /// Dispatch the migration at the head of the queue
    fn send_migration_to_driver(&mut self) -> Result<bool> {
        if matches!(self.migration_state, MigrationState::Dispatched { .. }) {
            return Ok(false);
        }
        let Some(req) = self.migration_queue.front().cloned() else {
            return Ok(false);
        };
        let v_addr = align_to_page(req.v_addr, self.config.log2_page_size);
        let page = self
            .page_table
            .find(req.pid, v_addr)
            .ok_or(VmError::PageNotFound { pid: req.pid, v_addr })?;

        // The page may have arrived for an earlier requester, or been
        // pinned; answer from the table instead of migrating again.
        if page.device_id == req.device_id || page.is_pinned {
            if !Self::respond(&req, page) {
                return Ok(false);
            }
            self.migration_queue.pop_front();
            self.finish_migration_for(page)?;
            self.stats.stale_migrations += 1;
            trace!(
                v_addr = format_args!("{:#x}", v_addr),
                device_id = req.device_id,
                "migration no longer needed"
            );
            return Ok(true);
        }

        let Some(out) = &self.migration_out else {
            return Ok(false);
        };
        let accessors = self
            .page_accessed_by_device
            .get(&v_addr)
            .cloned()
            .unwrap_or_default();
        let mut device_to_vaddrs: HashMap<DeviceId, Vec<u64>> = HashMap::new();
        device_to_vaddrs.insert(req.device_id, vec![v_addr]);

        let driver_req = PageMigrationReqToDriver {
            id: MsgId::next(),
            pid: req.pid,
            page_size: page.page_size,
            current_host_device: page.device_id,
            current_accessing_devices: accessors,
            device_to_vaddrs,
            respond_to_top: true,
            reply_to: self.migration_done_in.clone(),
        };
        if out.send(driver_req).is_err() {
            return Ok(false);
        }

        self.migration_queue.pop_front();
        self.migration_state = MigrationState::Dispatched { waiting: req };
        self.stats.migrations_started += 1;
        debug!(
            v_addr = format_args!("{:#x}", v_addr),
            from = page.device_id,
            "migration dispatched"
        );
        Ok(true)
    }

    /// Complete the outstanding migration when the driver reports back
    fn process_migration_return(&mut self) -> Result<bool> {
        if self.migration_done_in.peek().is_none() {
            return Ok(false);
        }
        let MigrationState::Dispatched { waiting } = &self.migration_state else {
            return Ok(false);
        };
        let req = waiting.clone();

        let v_addr = align_to_page(req.v_addr, self.config.log2_page_size);
        let page = self
            .page_table
            .find(req.pid, v_addr)
            .ok_or(VmError::PageNotFound { pid: req.pid, v_addr })?;

        // Pin and persist before answering, so every response (including
        // a replay coalesced onto the same fetch) sees the settled page.
        let mut settled = page;
        settled.is_pinned = true;
        settled.is_migrating = self.page_still_referenced(page.p_addr);
        self.page_table.update(settled)?;

        if !Self::respond(&req, settled) {
            return Ok(false);
        }
        self.migration_done_in.retrieve();

        self.migration_state = MigrationState::Idle;
        Ok(true)
    }
}

impl Tick for Mmu {
    fn tick(&mut self) -> Result<bool> {
        let mut progress = self.send_migration_to_driver()?;
        progress |= self.walk_page_table()?;
        progress |= self.process_migration_return()?;
        progress |= self.parse_from_top();
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Pid;

    fn setup() -> (Mmu, Arc<PageTable>, Port<TranslationRsp>) {
        let pt = Arc::new(PageTable::new(12));
        let mmu = Mmu::new(
            MmuConfig {
                page_walk_latency: 2,
                ..Default::default()
            },
            Arc::clone(&pt),
        )
        .unwrap();
        let agent = Port::new(16);
        (mmu, pt, agent)
    }

    fn local_page(pid: u32, v_addr: u64, device_id: DeviceId) -> Page {
        Page {
            pid: Pid(pid),
            v_addr,
            p_addr: 0x1_0000_0000 + v_addr,
            page_size: 4096,
            valid: true,
            device_id,
            ..Default::default()
        }
    }

    #[test]
    fn test_walk_takes_configured_latency() {
        let (mut mmu, pt, agent) = setup();
        pt.insert(local_page(1, 0x1000, 1)).unwrap();

        mmu.top_port()
            .send(TranslationReq::new(Pid(1), 0x1000, 1, agent.clone()))
            .unwrap();

        mmu.tick().unwrap(); // accepted
        mmu.tick().unwrap(); // counting down
        assert!(agent.is_empty());
        mmu.tick().unwrap();
        mmu.tick().unwrap();

        let rsp = agent.retrieve().expect("walk should have completed");
        assert_eq!(rsp.page.p_addr, 0x1_0000_1000);
        assert_eq!(mmu.stats().walks_completed, 1);
    }

    #[test]
    fn test_remote_unified_page_triggers_migration() {
        let (mut mmu, pt, agent) = setup();
        let mut page = local_page(1, 0x1000, 1);
        page.unified = true;
        pt.insert(page).unwrap();

        let driver = Port::new(4);
        mmu.connect_migration(driver.clone());

        // Device 2 touches a page homed on device 1.
        mmu.top_port()
            .send(TranslationReq::new(Pid(1), 0x1000, 2, agent.clone()))
            .unwrap();
        for _ in 0..6 {
            mmu.tick().unwrap();
        }

        assert!(agent.is_empty(), "no answer until the migration settles");
        let req = driver.retrieve().expect("migration request expected");
        assert_eq!(req.current_host_device, 1);
        assert_eq!(req.current_accessing_devices, vec![2]);
        assert_eq!(req.device_to_vaddrs[&2], vec![0x1000]);
        assert!(pt.find(Pid(1), 0x1000).unwrap().is_migrating);
        assert_eq!(mmu.stats().migrations_started, 1);

        // The driver re-homes the page and reports completion.
        let mut moved = page;
        moved.device_id = 2;
        moved.p_addr = 0x2_0000_1000;
        moved.is_migrating = true;
        pt.update(moved).unwrap();
        req.reply_to
            .send(PageMigrationRspFromDriver {
                respond_to: req.id,
                v_addrs: vec![0x1000],
                respond_to_top: req.respond_to_top,
            })
            .unwrap();
        mmu.tick().unwrap();

        let rsp = agent.retrieve().expect("requester answered after return");
        assert_eq!(rsp.page.device_id, 2);
        // The response itself carries the settled record, not a snapshot
        // taken before the pin.
        assert!(rsp.page.is_pinned);
        assert!(!rsp.page.is_migrating);
        let settled = pt.find(Pid(1), 0x1000).unwrap();
        assert!(settled.is_pinned);
        assert!(!settled.is_migrating);
    }

    #[test]
    fn test_one_migration_in_flight() {
        let (mut mmu, pt, agent) = setup();
        for (v_addr, home) in [(0x1000u64, 1u64), (0x2000, 3)] {
            let mut page = local_page(1, v_addr, home);
            page.unified = true;
            pt.insert(page).unwrap();
        }
        let driver = Port::new(4);
        mmu.connect_migration(driver.clone());

        mmu.top_port()
            .send(TranslationReq::new(Pid(1), 0x1000, 2, agent.clone()))
            .unwrap();
        mmu.top_port()
            .send(TranslationReq::new(Pid(1), 0x2000, 2, agent.clone()))
            .unwrap();
        for _ in 0..8 {
            mmu.tick().unwrap();
        }

        // Both faults queue, but only one reaches the driver.
        assert_eq!(driver.len(), 1);
        assert_eq!(mmu.stats().migrations_started, 1);
    }

    #[test]
    fn test_queued_request_served_after_arrival() {
        let (mut mmu, pt, agent) = setup();
        let mut page = local_page(1, 0x1000, 1);
        page.unified = true;
        pt.insert(page).unwrap();
        let driver = Port::new(4);
        mmu.connect_migration(driver.clone());

        // Two devices fault on the same page; the second queues behind
        // the first's migration.
        mmu.top_port()
            .send(TranslationReq::new(Pid(1), 0x1000, 2, agent.clone()))
            .unwrap();
        mmu.top_port()
            .send(TranslationReq::new(Pid(1), 0x1000, 3, agent.clone()))
            .unwrap();
        for _ in 0..8 {
            mmu.tick().unwrap();
        }
        let req = driver.retrieve().unwrap();

        let mut moved = page;
        moved.device_id = 2;
        moved.p_addr = 0x2_0000_1000;
        moved.is_migrating = true;
        pt.update(moved).unwrap();
        req.reply_to
            .send(PageMigrationRspFromDriver {
                respond_to: req.id,
                v_addrs: vec![0x1000],
                respond_to_top: req.respond_to_top,
            })
            .unwrap();
        for _ in 0..4 {
            mmu.tick().unwrap();
        }

        // First requester gets the migrated page, the second is served
        // from the table because the page is now pinned.
        assert_eq!(agent.len(), 2);
        let first = agent.retrieve().unwrap();
        let second = agent.retrieve().unwrap();
        assert_eq!(first.page.device_id, 2);
        assert!(second.page.is_pinned);
        assert!(driver.is_empty(), "pinned page never migrates again");
        assert_eq!(mmu.stats().stale_migrations, 1);
    }

    #[test]
    fn test_missing_page_is_an_error() {
        let (mut mmu, _pt, agent) = setup();
        mmu.top_port()
            .send(TranslationReq::new(Pid(1), 0x9000, 1, agent))
            .unwrap();
        mmu.tick().unwrap();
        mmu.tick().unwrap();
        mmu.tick().unwrap();
        let err = mmu.tick().unwrap_err();
        assert!(matches!(err, VmError::PageNotFound { .. }));
    }
}
