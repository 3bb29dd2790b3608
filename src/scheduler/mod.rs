pub mod filters;
pub mod memorizing;
pub mod time_shifting;
pub mod weighers;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use dslab_core::Id;
use rand::prelude::*;
use rand_pcg::Pcg64;

use crate::config::sim_config::{FilterConfig, SchedulerConfig, WeigherConfig};
use crate::entities::Server;
use crate::host::{HostModel, HostView};

use filters::{
    AcceleratorFilter, DifferentHostFilter, HostFilter, HostUpFilter, InstanceCountFilter,
    RamFilter, SameHostFilter, VCpuFilter,
};
use memorizing::MemorizingScheduler;
use time_shifting::TimeShiftingScheduler;
use weighers::{CoreRamWeigher, HostWeigher, InstanceCountWeigher, RamWeigher, VCpuWeigher};

/// One pending placement request for a server.
///
/// At most one non-cancelled request exists per server. Once cancelled a
/// request is never placed, only drained from the queue.
pub struct SchedulingRequest {
    pub server_id: u64,
    pub submitted_at: f64,
    cancelled: Cell<bool>,
    times_skipped: Cell<u32>,
}

impl SchedulingRequest {
    pub fn new(server_id: u64, submitted_at: f64) -> Self {
        SchedulingRequest {
            server_id,
            submitted_at,
            cancelled: Cell::new(false),
            times_skipped: Cell::new(0),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    pub fn times_skipped(&self) -> u32 {
        self.times_skipped.get()
    }

    pub(crate) fn record_skip(&self) {
        self.times_skipped.set(self.times_skipped.get() + 1);
    }
}

/// Outcome of one placement attempt.
///
/// `Empty` means no host fits right now but some host could once capacity
/// frees up; `Failure` means the request will never fit on any known host.
pub enum SchedulingResult {
    Success(Rc<RefCell<HostView>>),
    Empty,
    Failure,
}

/// Host-selection policy consulted by the compute service for the request at
/// the head of the admission queue.
pub trait Scheduler {
    fn add_host(&mut self, view: Rc<RefCell<HostView>>);
    fn remove_host(&mut self, host_id: Id);
    fn select(&mut self, request: &SchedulingRequest, server: &Server, now: f64) -> SchedulingResult;
    /// Whether this host model could satisfy the server when completely
    /// idle, judged by the physical capacity and the capacity filters.
    fn fits_idle_host(&self, model: &HostModel, server: &Server) -> bool;
}

/// Filter-and-weigh scheduler.
///
/// Hosts must pass every filter to stay candidates; candidates are ranked by
/// the summed weigher scores and the placement is drawn uniformly from the
/// top `subset_size` of them, which prevents pathological convergence onto a
/// single host under identical scores.
pub struct FilterScheduler {
    filters: Vec<Box<dyn HostFilter>>,
    weighers: Vec<Box<dyn HostWeigher>>,
    subset_size: usize,
    hosts: Vec<Rc<RefCell<HostView>>>,
    rng: Pcg64,
}

impl FilterScheduler {
    pub fn new(
        filters: Vec<Box<dyn HostFilter>>,
        weighers: Vec<Box<dyn HostWeigher>>,
        subset_size: usize,
        rng: Pcg64,
    ) -> Self {
        assert!(subset_size >= 1, "subset size must be a positive integer");
        FilterScheduler {
            filters,
            weighers,
            subset_size,
            hosts: Vec::new(),
            rng,
        }
    }

    pub(crate) fn hosts(&self) -> &[Rc<RefCell<HostView>>] {
        &self.hosts
    }

    /// Whether any registered host could ever satisfy the request.
    fn could_ever_fit(&self, server: &Server) -> bool {
        self.hosts
            .iter()
            .any(|view| self.fits_idle_host(&view.borrow().model, server))
    }
}

impl Scheduler for FilterScheduler {
    fn add_host(&mut self, view: Rc<RefCell<HostView>>) {
        let host_id = view.borrow().host_id;
        if self.hosts.iter().any(|v| v.borrow().host_id == host_id) {
            return;
        }
        self.hosts.push(view);
    }

    fn remove_host(&mut self, host_id: Id) {
        self.hosts.retain(|v| v.borrow().host_id != host_id);
    }

    fn fits_idle_host(&self, model: &HostModel, server: &Server) -> bool {
        model.can_fit_flavor(&server.flavor)
            && self.filters.iter().all(|f| f.passes_idle_host(model, server))
    }

    fn select(&mut self, _request: &SchedulingRequest, server: &Server, _now: f64) -> SchedulingResult {
        // The physical model bound always applies: overcommit ratios relax
        // sharing across instances, never the span of a single guest.
        let candidates = self
            .hosts
            .iter()
            .filter(|view| {
                let view = view.borrow();
                view.model.can_fit_flavor(&server.flavor)
                    && self.filters.iter().all(|f| f.test(&view, server))
            })
            .cloned()
            .collect::<Vec<_>>();

        if candidates.is_empty() {
            return if self.could_ever_fit(server) {
                SchedulingResult::Empty
            } else {
                SchedulingResult::Failure
            };
        }

        let mut weighted = candidates
            .into_iter()
            .map(|view| {
                let weight: f64 = {
                    let view = view.borrow();
                    self.weighers.iter().map(|w| w.weigh(&view, server)).sum()
                };
                (weight, view)
            })
            .collect::<Vec<_>>();
        weighted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());

        let subset = self.subset_size.min(weighted.len());
        let pick = self.rng.gen_range(0..subset);
        SchedulingResult::Success(weighted[pick].1.clone())
    }
}

fn filter_from_config(config: &FilterConfig) -> Box<dyn HostFilter> {
    match config {
        FilterConfig::HostUp => Box::new(HostUpFilter),
        FilterConfig::Ram { allocation_ratio } => Box::new(RamFilter::new(*allocation_ratio)),
        FilterConfig::VCpu { allocation_ratio } => Box::new(VCpuFilter::new(*allocation_ratio)),
        FilterConfig::InstanceCount { max_instance_count } => {
            Box::new(InstanceCountFilter::new(*max_instance_count))
        }
        FilterConfig::Accelerator => Box::new(AcceleratorFilter),
        FilterConfig::SameHost => Box::new(SameHostFilter),
        FilterConfig::DifferentHost => Box::new(DifferentHostFilter),
    }
}

fn weigher_from_config(config: &WeigherConfig) -> Box<dyn HostWeigher> {
    match config {
        WeigherConfig::Ram { multiplier } => Box::new(RamWeigher::new(*multiplier)),
        WeigherConfig::CoreRam { multiplier } => Box::new(CoreRamWeigher::new(*multiplier)),
        WeigherConfig::VCpu { multiplier } => Box::new(VCpuWeigher::new(*multiplier)),
        WeigherConfig::InstanceCount { multiplier } => {
            Box::new(InstanceCountWeigher::new(*multiplier))
        }
    }
}

/// Builds the scheduler described by the config section, wrapping the base
/// filter scheduler into the configured variant policies.
pub fn scheduler_from_config(config: &SchedulerConfig, seed: u64) -> Box<dyn Scheduler> {
    let filters = config.filters.iter().map(filter_from_config).collect();
    let weighers = config.weighers.iter().map(weigher_from_config).collect();
    let base = FilterScheduler::new(
        filters,
        weighers,
        config.subset_size.unwrap_or(1),
        Pcg64::seed_from_u64(seed),
    );
    if let Some(time_shift) = &config.time_shift {
        return Box::new(TimeShiftingScheduler::new(
            base,
            time_shift.window,
            time_shift.utilization_threshold,
        ));
    }
    if let Some(max_times_skipped) = config.max_times_skipped {
        return Box::new(MemorizingScheduler::new(base, max_times_skipped));
    }
    Box::new(base)
}
