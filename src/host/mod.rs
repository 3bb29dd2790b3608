pub mod hypervisor;
pub mod view;

use std::cell::RefCell;
use std::rc::Rc;

use dslab_core::{cast, log_debug, log_info, Event, EventHandler, Id, SimulationContext};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entities::{Flavor, Server};
use crate::monitoring::Monitoring;

pub use hypervisor::{FairShareHypervisor, FlowStats, Hypervisor, SpaceSharedHypervisor};
pub use view::HostView;

/// Capacity model of an accelerator attached to a host.
#[derive(Clone, Serialize, Deserialize)]
pub struct GpuModel {
    pub core_count: u32,
}

/// Immutable capacity model of a physical host.
#[derive(Clone, Serialize)]
pub struct HostModel {
    pub core_count: u32,
    /// Work units per second delivered by one core.
    pub core_speed: f64,
    pub memory_capacity: u64,
    pub gpu: Option<GpuModel>,
}

impl HostModel {
    pub fn new(core_count: u32, core_speed: f64, memory_capacity: u64) -> Self {
        HostModel {
            core_count,
            core_speed,
            memory_capacity,
            gpu: None,
        }
    }

    pub fn with_gpu(mut self, core_count: u32) -> Self {
        self.gpu = Some(GpuModel { core_count });
        self
    }

    pub fn cpu_capacity(&self) -> f64 {
        self.core_count as f64 * self.core_speed
    }

    /// Whether the flavor fits the physical capacity of this host. A guest
    /// can never span more cores, memory or accelerator cores than the host
    /// has, no matter what overcommit ratios the filters allow.
    pub fn can_fit_flavor(&self, flavor: &Flavor) -> bool {
        let gpu_fits = match &self.gpu {
            Some(gpu) => flavor.gpu_core_count() <= gpu.core_count,
            None => flavor.gpu_core_count() == 0,
        };
        flavor.core_count <= self.core_count && flavor.memory_size <= self.memory_capacity && gpu_fits
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("host is down")]
    HostDown,
    #[error("server {0} is already deployed on this host")]
    AlreadyDeployed(u64),
    #[error("server {0} has no guest on this host")]
    UnknownGuest(u64),
}

/// Emitted to the compute service when a host changes its up/down state.
#[derive(Clone, Serialize)]
pub struct HostStateChanged {
    pub host_id: Id,
    pub up: bool,
}

/// Emitted to the compute service when a guest finishes its work.
#[derive(Clone, Serialize)]
pub struct WorkloadFinished {
    pub server_id: u64,
}

/// Self-emitted when a guest is predicted to run out of work. Stale events
/// (previous epochs) are dropped: every redistribution bumps the epoch and
/// re-emits fresh completions.
#[derive(Clone, Serialize)]
struct GuestDone {
    server_id: u64,
    epoch: u64,
}

/// Self-emitted on every flow-stats reporting period.
#[derive(Clone, Serialize)]
struct FlushFlowStats {}

struct Guest {
    /// Remaining CPU work, `None` for servers that run until stopped.
    remaining_work: Option<f64>,
    started: bool,
}

/// Simulated physical host: owns exactly one multiplexing hypervisor, tracks
/// its guests and reports workload completions to the compute service.
pub struct SimHost {
    model: HostModel,
    up: bool,
    hypervisor: Box<dyn Hypervisor>,
    guests: FxHashMap<u64, Guest>,
    service_id: Id,
    monitoring: Rc<RefCell<Monitoring>>,
    stats_interval: Option<f64>,
    epoch: u64,
    last_sync: f64,
    ctx: SimulationContext,
}

impl SimHost {
    pub fn new(
        ctx: SimulationContext,
        model: HostModel,
        hypervisor: Box<dyn Hypervisor>,
        monitoring: Rc<RefCell<Monitoring>>,
        stats_interval: Option<f64>,
    ) -> Self {
        SimHost {
            model,
            up: true,
            hypervisor,
            guests: FxHashMap::default(),
            service_id: u32::MAX, // must be set later
            monitoring,
            stats_interval,
            epoch: 0,
            last_sync: 0.,
            ctx,
        }
    }

    pub fn id(&self) -> Id {
        self.ctx.id()
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn model(&self) -> &HostModel {
        &self.model
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn set_service(&mut self, service_id: Id) {
        self.service_id = service_id;
    }

    /// Starts periodic flow-stats reporting.
    pub fn start(&mut self) {
        if let Some(interval) = self.stats_interval {
            self.ctx.emit_self(FlushFlowStats {}, interval);
        }
    }

    /// Whether a guest with this core span can be admitted right now.
    pub fn can_fit(&self, core_count: u32) -> bool {
        self.hypervisor.can_fit(core_count)
    }

    /// Registers a guest context for the server. The guest does not consume
    /// CPU until `start_server` is called.
    pub fn spawn_server(&mut self, server: &Server) -> Result<(), HostError> {
        if !self.up {
            return Err(HostError::HostDown);
        }
        if self.guests.contains_key(&server.id) {
            return Err(HostError::AlreadyDeployed(server.id));
        }
        self.sync();
        self.hypervisor.create_context(server.id, server.flavor.core_count);
        self.guests.insert(
            server.id,
            Guest {
                remaining_work: server.work,
                started: false,
            },
        );
        log_debug!(self.ctx, "spawned server {} ({})", server.id, server.name);
        Ok(())
    }

    /// Boots a spawned guest: it starts demanding its full core allotment.
    pub fn start_server(&mut self, server_id: u64) -> Result<(), HostError> {
        if !self.up {
            return Err(HostError::HostDown);
        }
        let guest = self
            .guests
            .get_mut(&server_id)
            .ok_or(HostError::UnknownGuest(server_id))?;
        guest.started = true;
        self.sync();
        let demand = f64::MAX; // capped to the guest core allotment
        self.hypervisor.set_demand(server_id, demand);
        self.reschedule_completions();
        Ok(())
    }

    /// Retires the guest context of a stopped server.
    pub fn stop_server(&mut self, server_id: u64) -> Result<(), HostError> {
        self.retire_guest(server_id)
    }

    /// Retires the guest context of a deleted server. Tolerates guests that
    /// were already dropped (e.g. after the host went down).
    pub fn delete_server(&mut self, server_id: u64) {
        let _ = self.retire_guest(server_id);
    }

    fn retire_guest(&mut self, server_id: u64) -> Result<(), HostError> {
        if self.guests.remove(&server_id).is_none() {
            return Err(HostError::UnknownGuest(server_id));
        }
        self.sync();
        self.hypervisor.remove_context(server_id);
        self.reschedule_completions();
        log_debug!(self.ctx, "retired server {}", server_id);
        Ok(())
    }

    /// Flips the host up/down state and notifies the compute service.
    /// Going down drops all guest contexts; their servers are moved to the
    /// error state by the service.
    pub fn set_up(&mut self, up: bool) {
        if self.up == up {
            return;
        }
        self.sync();
        self.up = up;
        if !up {
            let ids = self.guests.keys().copied().collect::<Vec<_>>();
            for id in ids {
                self.hypervisor.remove_context(id);
                self.guests.remove(&id);
            }
            self.epoch += 1; // invalidate in-flight completions
        }
        log_info!(self.ctx, "host {} is {}", self.name(), if up { "up" } else { "down" });
        self.ctx.emit_now(
            HostStateChanged {
                host_id: self.id(),
                up,
            },
            self.service_id,
        );
    }

    /// Advances guest progress and flow aggregates to the current time with
    /// the rates that held since the previous sync.
    fn sync(&mut self) {
        let now = self.ctx.time();
        let dt = now - self.last_sync;
        if dt > 0. {
            for (id, guest) in self.guests.iter_mut() {
                if let Some(remaining) = &mut guest.remaining_work {
                    *remaining = (*remaining - self.hypervisor.granted_rate(*id) * dt).max(0.);
                }
            }
        }
        self.hypervisor.advance(now);
        self.last_sync = now;
    }

    /// Re-emits completion events for all finite guests under the current
    /// rates; previously emitted completions become stale.
    fn reschedule_completions(&mut self) {
        self.epoch += 1;
        for (id, guest) in &self.guests {
            if !guest.started {
                continue;
            }
            if let Some(remaining) = guest.remaining_work {
                let rate = self.hypervisor.granted_rate(*id);
                if rate > 0. {
                    self.ctx.emit_self(
                        GuestDone {
                            server_id: *id,
                            epoch: self.epoch,
                        },
                        remaining / rate,
                    );
                }
            }
        }
    }

    fn on_guest_done(&mut self, server_id: u64, epoch: u64) {
        if epoch != self.epoch || !self.guests.contains_key(&server_id) {
            return;
        }
        self.sync();
        self.guests.remove(&server_id);
        self.hypervisor.remove_context(server_id);
        self.reschedule_completions();
        log_debug!(self.ctx, "server {} finished its work", server_id);
        self.ctx.emit_now(WorkloadFinished { server_id }, self.service_id);
    }

    fn on_flush_flow_stats(&mut self) {
        self.sync();
        let stats = self.hypervisor.flush_stats();
        let name = self.ctx.name().to_string();
        self.monitoring
            .borrow_mut()
            .record_flow(self.ctx.time(), &name, stats);
        if let Some(interval) = self.stats_interval {
            self.ctx.emit_self(FlushFlowStats {}, interval);
        }
    }
}

impl EventHandler for SimHost {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            GuestDone { server_id, epoch } => {
                self.on_guest_done(server_id, epoch);
            }
            FlushFlowStats {} => {
                self.on_flush_flow_stats();
            }
        });
    }
}
