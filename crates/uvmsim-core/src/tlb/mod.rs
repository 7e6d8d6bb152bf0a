//! Translation lookaside buffer
//!
//! A set-associative translation cache with miss coalescing and an
//! explicit pause/resume control protocol. Per tick, the control channel
//! is serviced first; when not paused, up to `num_req_per_cycle` requests
//! move through each of three stages: answering waiters of a completed
//! miss, fresh lookups, and draining downstream responses.
//!
//! Every stage is an idempotent no-op when its outbound port is full: the
//! triggering message stays queued and the stage retries next tick.

mod mshr;
mod set;

pub use mshr::{Mshr, MshrEntry};
pub use set::Set;

use tracing::{debug, trace};

use crate::config::TlbConfig;
use crate::error::Result;
use crate::page::{align_to_page, Page};
use crate::port::{Port, Tick};
use crate::proto::{TlbCtrlReq, TlbCtrlRsp, TranslationReq, TranslationRsp};

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default)]
pub struct TlbStats {
    /// Lookups answered from a set
    pub hits: u64,
    /// Lookups that started a downstream fetch
    pub misses: u64,
    /// Lookups folded into an existing in-flight miss
    pub mshr_hits: u64,
    /// Flushes applied
    pub flushes: u64,
    /// Downstream responses with no matching MSHR entry
    pub stale_responses: u64,
}

/// Set-associative translation cache with MSHR-based miss handling
pub struct Tlb {
    config: TlbConfig,
    log2_page_size: u64,

    sets: Vec<Set>,
    mshr: Mshr,
    responding_entry: Option<MshrEntry>,
    paused: bool,

    top_in: Port<TranslationReq>,
    bottom_in: Port<TranslationRsp>,
    bottom_out: Option<Port<TranslationReq>>,
    ctrl_in: Port<TlbCtrlReq>,

    stats: TlbStats,
}

impl Tlb {
    /// Create a TLB from a validated configuration
    pub fn new(config: TlbConfig) -> Result<Self> {
        config.validate()?;
        let sets = (0..config.num_sets).map(|_| Set::new(config.num_ways)).collect();
        Ok(Self {
            log2_page_size: config.page_size.trailing_zeros() as u64,
            sets,
            mshr: Mshr::new(config.mshr_capacity),
            responding_entry: None,
            paused: false,
            top_in: Port::new(config.port_capacity),
            bottom_in: Port::new(config.port_capacity),
            bottom_out: None,
            ctrl_in: Port::new(config.port_capacity),
            stats: TlbStats::default(),
            config,
        })
    }

    /// Port agents send translation requests to
    pub fn top_port(&self) -> Port<TranslationReq> {
        self.top_in.clone()
    }

    /// Port for flush/restart control requests
    pub fn ctrl_port(&self) -> Port<TlbCtrlReq> {
        self.ctrl_in.clone()
    }

    /// Wire the downstream translation provider (the MMU's top port)
    pub fn connect_bottom(&mut self, port: Port<TranslationReq>) {
        self.bottom_out = Some(port);
    }

    /// Counter snapshot
    pub fn stats(&self) -> TlbStats {
        self.stats
    }

    /// Whether the TLB is currently paused by a flush
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn set_id_for(&self, v_addr: u64) -> usize {
        ((v_addr / self.config.page_size) % self.config.num_sets as u64) as usize
    }

    /// Answer one waiter of the completed miss being responded
    fn respond_mshr_entry(&mut self) -> bool {
        let Some(entry) = &mut self.responding_entry else {
            return false;
        };
        let (Some(page), Some(req)) = (entry.page, entry.requests.front()) else {
            self.responding_entry = None;
            return false;
        };

        let rsp = TranslationRsp {
            respond_to: req.id,
            page,
        };
        if req.reply_to.send(rsp).is_err() {
            return false;
        }

        entry.requests.pop_front();
        if entry.requests.is_empty() {
            self.responding_entry = None;
        }
        true
    }

    /// Service one queued translation request
    fn lookup(&mut self) -> Result<bool> {
        let Some(req) = self.top_in.peek() else {
            return Ok(false);
        };
        let v_addr = align_to_page(req.v_addr, self.log2_page_size);

        // Coalesce with an in-flight miss for the same page.
        if let Some(entry) = self.mshr.query(req.pid, v_addr) {
            entry.requests.push_back(req);
            self.top_in.retrieve();
            self.stats.mshr_hits += 1;
            return Ok(true);
        }

        let set_id = self.set_id_for(v_addr);
        if let Some((way, page)) = self.sets[set_id].lookup(req.pid, v_addr) {
            if page.valid {
                return Ok(self.handle_hit(req, set_id, way, page));
            }
        }
        self.handle_miss(req, v_addr)
    }

    fn handle_hit(
        &mut self,
        req: TranslationReq,
        set_id: usize,
        way: usize,
        page: Page,
    ) -> bool {
        let rsp = TranslationRsp {
            respond_to: req.id,
            page,
        };
        if req.reply_to.send(rsp).is_err() {
            return false;
        }
        self.sets[set_id].visit(way);
        self.top_in.retrieve();
        self.stats.hits += 1;
        true
    }

    fn handle_miss(&mut self, req: TranslationReq, v_addr: u64) -> Result<bool> {
        if self.mshr.is_full() {
            return Ok(false);
        }
        let Some(bottom_out) = &self.bottom_out else {
            return Ok(false);
        };

        let fetch = TranslationReq::new(req.pid, v_addr, req.device_id, self.bottom_in.clone());
        let fetch_id = fetch.id;
        if bottom_out.send(fetch).is_err() {
            return Ok(false);
        }

        let entry = self.mshr.add(req.pid, v_addr, fetch_id);
        entry.requests.push_back(req);
        self.top_in.retrieve();
        self.stats.misses += 1;
        Ok(true)
    }

    /// Drain one response from the downstream provider
    fn parse_bottom(&mut self) -> Result<bool> {
        if self.responding_entry.is_some() {
            return Ok(false);
        }
        let Some(rsp) = self.bottom_in.peek() else {
            return Ok(false);
        };
        let page = rsp.page;

        if !self.mshr.is_entry_present(page.pid, page.v_addr) {
            // Stale or duplicate response; a flush reset the entry.
            self.bottom_in.retrieve();
            self.stats.stale_responses += 1;
            trace!(
                pid = page.pid.raw(),
                v_addr = format_args!("{:#x}", page.v_addr),
                "discarding response without MSHR entry"
            );
            return Ok(true);
        }

        let set_id = self.set_id_for(page.v_addr);
        let way = self.sets[set_id].evict()?;
        self.sets[set_id].update(way, page);
        self.sets[set_id].visit(way);

        if let Some(mut entry) = self.mshr.remove(page.pid, page.v_addr) {
            entry.page = Some(page);
            self.responding_entry = Some(entry);
        }
        self.bottom_in.retrieve();
        Ok(true)
    }

    /// Service the control channel; always runs before data traffic
    fn perform_ctrl(&mut self) -> bool {
        let Some(req) = self.ctrl_in.peek() else {
            return false;
        };
        match req {
            TlbCtrlReq::Flush {
                id,
                pid,
                v_addrs,
                reply_to,
            } => {
                if reply_to.send(TlbCtrlRsp::FlushDone { respond_to: id }).is_err() {
                    return false;
                }
                self.ctrl_in.retrieve();

                for v_addr in v_addrs {
                    let v_addr = align_to_page(v_addr, self.log2_page_size);
                    let set_id = self.set_id_for(v_addr);
                    if let Some((way, mut page)) = self.sets[set_id].lookup(pid, v_addr) {
                        page.valid = false;
                        self.sets[set_id].update(way, page);
                    }
                }
                self.mshr.reset();
                self.responding_entry = None;
                self.paused = true;
                self.stats.flushes += 1;
                debug!(pid = pid.raw(), "TLB flushed and paused");
                true
            }
            TlbCtrlReq::Restart { id, reply_to } => {
                if reply_to
                    .send(TlbCtrlRsp::RestartDone { respond_to: id })
                    .is_err()
                {
                    return false;
                }
                self.ctrl_in.retrieve();

                self.paused = false;
                // Requests that queued while paused may carry stale
                // translations; drop them.
                self.top_in.drain();
                self.bottom_in.drain();
                debug!("TLB restarted");
                true
            }
        }
    }
}

impl Tick for Tlb {
    fn tick(&mut self) -> Result<bool> {
        let mut progress = self.perform_ctrl();

        if !self.paused {
            for _ in 0..self.config.num_req_per_cycle {
                progress |= self.respond_mshr_entry();
            }
            for _ in 0..self.config.num_req_per_cycle {
                progress |= self.lookup()?;
            }
            for _ in 0..self.config.num_req_per_cycle {
                progress |= self.parse_bottom()?;
            }
        }

        Ok(progress)
    }
}
