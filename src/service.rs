//! Compute service: admission queue, paced scheduling cycles, host registry
//! and the provisioning API surface.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use dslab_core::{cast, log_debug, log_error, log_info, Event, EventHandler, Id, SimulationContext};
use rand::Rng;
use rand_pcg::Pcg64;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use thiserror::Error;

use crate::entities::{Flavor, Image, Server, ServerState, ServerWatcher};
use crate::host::{HostStateChanged, HostView, SimHost, WorkloadFinished};
use crate::monitoring::Monitoring;
use crate::scheduler::{Scheduler, SchedulingRequest, SchedulingResult};

/// Self-emitted at the next quantum boundary; coalesces all triggers that
/// arrived since the previous cycle into a single pass.
#[derive(Clone, Serialize)]
pub struct SchedulePass {}

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("compute service is closed")]
    ServiceClosed,
    #[error("client session is closed")]
    ClientClosed,
    #[error("unknown flavor {0}")]
    UnknownFlavor(u64),
    #[error("unknown image {0}")]
    UnknownImage(u64),
    #[error("unknown server {0}")]
    UnknownServer(u64),
    #[error("server {id} is in state {state:?}, operation not allowed")]
    InvalidState { id: u64, state: ServerState },
}

/// Aggregate scheduler statistics consumed by the telemetry sink.
#[derive(Clone, Copy, Default, Serialize, Debug)]
pub struct SchedulerStats {
    pub hosts_available: u32,
    pub hosts_unavailable: u32,
    pub attempts_success: u64,
    pub attempts_failure: u64,
    pub attempts_error: u64,
    pub servers_pending: u32,
    pub servers_active: u32,
}

/// Parameters for creating a server.
#[derive(Default)]
pub struct ServerRequest {
    pub name: String,
    pub flavor_id: u64,
    pub image_id: u64,
    pub labels: HashMap<String, String>,
    pub meta: HashMap<String, String>,
    /// Total CPU work to perform; `None` runs until stopped.
    pub work: Option<f64>,
    pub deadline: Option<f64>,
    pub duration_hint: Option<f64>,
}

pub struct ComputeService {
    scheduler: Box<dyn Scheduler>,
    quantum: f64,

    queue: VecDeque<Rc<SchedulingRequest>>,
    /// The single outstanding (non-cancelled) request per provisioning server.
    pending_requests: FxHashMap<u64, Rc<SchedulingRequest>>,

    hosts: FxHashMap<Id, Rc<RefCell<SimHost>>>,
    host_views: FxHashMap<Id, Rc<RefCell<HostView>>>,

    servers: FxHashMap<u64, Rc<RefCell<Server>>>,
    flavors: FxHashMap<u64, Rc<Flavor>>,
    images: FxHashMap<u64, Rc<Image>>,
    /// Ids of deleted servers, kept to distinguish an invalid-state start
    /// from a reference that never existed.
    deleted_servers: FxHashSet<u64>,

    stats: SchedulerStats,
    pass_requested: bool,
    closed: bool,

    monitoring: Rc<RefCell<Monitoring>>,
    rng: Pcg64,
    ctx: SimulationContext,
}

impl ComputeService {
    pub fn new(
        ctx: SimulationContext,
        scheduler: Box<dyn Scheduler>,
        monitoring: Rc<RefCell<Monitoring>>,
        quantum: f64,
        rng: Pcg64,
    ) -> Self {
        assert!(quantum > 0., "scheduling quantum must be positive");
        ComputeService {
            scheduler,
            quantum,
            queue: VecDeque::new(),
            pending_requests: FxHashMap::default(),
            hosts: FxHashMap::default(),
            host_views: FxHashMap::default(),
            servers: FxHashMap::default(),
            flavors: FxHashMap::default(),
            images: FxHashMap::default(),
            deleted_servers: FxHashSet::default(),
            stats: SchedulerStats::default(),
            pass_requested: false,
            closed: false,
            monitoring,
            rng,
            ctx,
        }
    }

    pub fn id(&self) -> Id {
        self.ctx.id()
    }

    /// Closes the service; all further client operations are rejected.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // Host registry

    pub fn add_host(&mut self, host: Rc<RefCell<SimHost>>) -> Id {
        let (id, name, model, up) = {
            let host = host.borrow();
            (host.id(), host.name().to_string(), host.model().clone(), host.is_up())
        };
        let view = Rc::new(RefCell::new(HostView::new(id, name, model)));
        view.borrow_mut().available = up;
        if up {
            self.scheduler.add_host(view.clone());
        }
        self.hosts.insert(id, host);
        self.host_views.insert(id, view);
        id
    }

    pub fn host_view(&self, host_id: Id) -> Option<Rc<RefCell<HostView>>> {
        self.host_views.get(&host_id).cloned()
    }

    // Flavor registry

    pub fn create_flavor(
        &mut self,
        name: &str,
        core_count: u32,
        memory_size: u64,
    ) -> Result<u64, ComputeError> {
        self.ensure_open()?;
        let id = self.next_id();
        self.flavors
            .insert(id, Rc::new(Flavor::new(id, name.to_string(), core_count, memory_size)));
        Ok(id)
    }

    pub fn flavor(&self, id: u64) -> Option<Rc<Flavor>> {
        self.flavors.get(&id).cloned()
    }

    pub fn delete_flavor(&mut self, id: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        self.flavors
            .remove(&id)
            .map(|_| ())
            .ok_or(ComputeError::UnknownFlavor(id))
    }

    // Image registry

    pub fn create_image(&mut self, name: &str) -> Result<u64, ComputeError> {
        self.ensure_open()?;
        let id = self.next_id();
        self.images.insert(id, Rc::new(Image::new(id, name.to_string())));
        Ok(id)
    }

    pub fn image(&self, id: u64) -> Option<Rc<Image>> {
        self.images.get(&id).cloned()
    }

    /// No-op: the in-memory image is authoritative.
    pub fn reload_image(&mut self, id: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        self.images
            .get(&id)
            .map(|_| ())
            .ok_or(ComputeError::UnknownImage(id))
    }

    pub fn delete_image(&mut self, id: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        self.images
            .remove(&id)
            .map(|_| ())
            .ok_or(ComputeError::UnknownImage(id))
    }

    // Server lifecycle

    pub fn create_server(&mut self, request: ServerRequest) -> Result<u64, ComputeError> {
        self.ensure_open()?;
        let flavor = self
            .flavors
            .get(&request.flavor_id)
            .cloned()
            .ok_or(ComputeError::UnknownFlavor(request.flavor_id))?;
        let image = self
            .images
            .get(&request.image_id)
            .cloned()
            .ok_or(ComputeError::UnknownImage(request.image_id))?;
        let id = self.next_id();
        let mut server = Server::new(id, request.name, flavor, image);
        server.labels = request.labels;
        server.meta = request.meta;
        server.work = request.work;
        server.deadline = request.deadline;
        server.duration_hint = request.duration_hint;
        self.servers.insert(id, Rc::new(RefCell::new(server)));
        Ok(id)
    }

    /// Submits a scheduling request for the server. A no-op for servers that
    /// are already provisioning or running.
    pub fn start_server(&mut self, id: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        let server = self.resolve_server(id)?;
        let state = server.borrow().state();
        match state {
            ServerState::Provisioning | ServerState::Running => Ok(()),
            ServerState::Error => Err(ComputeError::InvalidState { id, state }),
            ServerState::Deleted => unreachable!("deleted servers leave the registry"),
            ServerState::Terminated => {
                let request = Rc::new(SchedulingRequest::new(id, self.ctx.time()));
                self.queue.push_back(request.clone());
                self.pending_requests.insert(id, request);
                server.borrow_mut().set_state(ServerState::Provisioning);
                self.stats.servers_pending += 1;
                log_debug!(self.ctx, "server {} queued for scheduling", id);
                self.request_schedule();
                Ok(())
            }
        }
    }

    /// Stops the server: cancels its pending request while provisioning, or
    /// retires its workload on the bound host.
    pub fn stop_server(&mut self, id: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        let server = self.resolve_server(id)?;
        let state = server.borrow().state();
        match state {
            ServerState::Terminated => Ok(()),
            ServerState::Deleted => unreachable!("deleted servers leave the registry"),
            ServerState::Provisioning => {
                self.cancel_request(id);
                server.borrow_mut().set_state(ServerState::Terminated);
                Ok(())
            }
            ServerState::Running | ServerState::Error => {
                self.retire_placed_server(&server, state);
                server.borrow_mut().set_state(ServerState::Terminated);
                self.request_schedule();
                Ok(())
            }
        }
    }

    /// Deletes the server from any non-deleted state, releasing reserved
    /// capacity exactly once.
    pub fn delete_server(&mut self, id: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        let server = self.resolve_server(id)?;
        let state = server.borrow().state();
        match state {
            ServerState::Deleted => unreachable!("deleted servers leave the registry"),
            ServerState::Provisioning => self.cancel_request(id),
            ServerState::Running | ServerState::Error => {
                self.retire_placed_server(&server, state);
                self.request_schedule();
            }
            ServerState::Terminated => {}
        }
        server.borrow_mut().set_state(ServerState::Deleted);
        self.servers.remove(&id);
        self.deleted_servers.insert(id);
        Ok(())
    }

    pub fn server(&self, id: u64) -> Option<Rc<RefCell<Server>>> {
        self.servers.get(&id).cloned()
    }

    pub fn find_server(&self, name: &str) -> Option<u64> {
        self.servers
            .values()
            .find(|s| s.borrow().name == name)
            .map(|s| s.borrow().id)
    }

    pub fn watch_server(
        &mut self,
        id: u64,
        watcher: Rc<dyn ServerWatcher>,
    ) -> Result<u64, ComputeError> {
        self.ensure_open()?;
        let server = self.resolve_server(id)?;
        let token = server.borrow_mut().watch(watcher);
        Ok(token)
    }

    pub fn unwatch_server(&mut self, id: u64, token: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        let server = self.resolve_server(id)?;
        server.borrow_mut().unwatch(token);
        Ok(())
    }

    // Statistics

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.stats;
        for view in self.host_views.values() {
            if view.borrow().available {
                stats.hosts_available += 1;
            } else {
                stats.hosts_unavailable += 1;
            }
        }
        stats
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    // Scheduling cycle

    /// Requests a scheduling cycle at the next quantum boundary. Triggers
    /// arriving before that cycle runs collapse into the single pass.
    fn request_schedule(&mut self) {
        if self.queue.is_empty() || self.pass_requested {
            return;
        }
        self.pass_requested = true;
        let remainder = self.ctx.time() % self.quantum;
        let delay = if remainder == 0. {
            self.quantum
        } else {
            self.quantum - remainder
        };
        self.ctx.emit_self(SchedulePass {}, delay);
    }

    fn do_schedule(&mut self) {
        loop {
            let Some(request) = self.queue.front().cloned() else {
                break;
            };
            // Cooperative cancellation: drained at dequeue time, not counted
            // as an attempt.
            if request.is_cancelled() {
                self.queue.pop_front();
                continue;
            }
            let server_rc = self
                .servers
                .get(&request.server_id)
                .cloned()
                .unwrap_or_else(|| panic!("pending server {} is not registered", request.server_id));

            let result = {
                let server = server_rc.borrow();
                self.scheduler.select(&request, &server, self.ctx.time())
            };
            match result {
                SchedulingResult::Empty => {
                    // Might fit once capacity frees up: leave the request at
                    // the head for the next triggered cycle.
                    break;
                }
                SchedulingResult::Failure => {
                    // A capable host may merely be down: the request stays
                    // queued until the host comes back.
                    if self.down_host_could_fit(&server_rc.borrow()) {
                        break;
                    }
                    self.queue.pop_front();
                    self.pending_requests.remove(&request.server_id);
                    self.stats.attempts_failure += 1;
                    self.stats.servers_pending -= 1;
                    server_rc.borrow_mut().set_state(ServerState::Terminated);
                    log_info!(
                        self.ctx,
                        "server {} can never fit on any known host",
                        request.server_id
                    );
                }
                SchedulingResult::Success(view) => {
                    // The multiplexer can be stricter than the configured
                    // filters (space sharing); wait for its cores to free up
                    // instead of violating its admission bound.
                    let host_id = view.borrow().host_id;
                    let host = self.hosts.get(&host_id).unwrap();
                    if !host.borrow().can_fit(server_rc.borrow().flavor.core_count) {
                        break;
                    }
                    self.queue.pop_front();
                    self.pending_requests.remove(&request.server_id);
                    self.stats.servers_pending -= 1;
                    self.place_server(&server_rc, view);
                }
            }
        }
    }

    fn place_server(&mut self, server_rc: &Rc<RefCell<Server>>, view: Rc<RefCell<HostView>>) {
        let host_id = view.borrow().host_id;
        view.borrow_mut().provision(&server_rc.borrow());
        server_rc.borrow_mut().bind_host(host_id);

        let host = self.hosts.get(&host_id).unwrap().clone();
        let server_id = server_rc.borrow().id;
        let spawned = host.borrow_mut().spawn_server(&server_rc.borrow());
        let deploy = match spawned {
            Ok(()) => host.borrow_mut().start_server(server_id),
            Err(e) => Err(e),
        };
        match deploy {
            Ok(()) => {
                let mut server = server_rc.borrow_mut();
                server.launched_at = Some(self.ctx.time());
                server.set_state(ServerState::Running);
                self.stats.attempts_success += 1;
                self.stats.servers_active += 1;
                log_debug!(self.ctx, "server {} placed on host {}", server_id, host_id);
            }
            Err(e) => {
                // The reservation stays with the errored server and is
                // released exactly once when it is stopped or deleted.
                log_error!(self.ctx, "failed to deploy server {}: {}", server_id, e);
                server_rc.borrow_mut().set_state(ServerState::Error);
                self.stats.attempts_error += 1;
            }
        }
    }

    /// Releases the reserved capacity of a running or errored server and
    /// retires its guest on the bound host.
    fn retire_placed_server(&mut self, server_rc: &Rc<RefCell<Server>>, state: ServerState) {
        let host_id = {
            let server = server_rc.borrow();
            server.host().expect("placed server must be bound to a host")
        };
        if let Some(host) = self.hosts.get(&host_id) {
            host.borrow_mut().delete_server(server_rc.borrow().id);
        }
        let view = self.host_views.get(&host_id).unwrap();
        view.borrow_mut().release(&server_rc.borrow());
        server_rc.borrow_mut().clear_host();
        if state == ServerState::Running {
            self.stats.servers_active -= 1;
        }
    }

    /// Whether some host that is currently down could fit the server when
    /// completely free. Feasibility is judged by the same idle-host test the
    /// scheduler applies to hosts in the up state, so an outage never turns
    /// a transient miss into a permanent failure or vice versa.
    fn down_host_could_fit(&self, server: &Server) -> bool {
        self.host_views.values().any(|view| {
            let view = view.borrow();
            !view.available && self.scheduler.fits_idle_host(&view.model, server)
        })
    }

    fn cancel_request(&mut self, server_id: u64) {
        if let Some(request) = self.pending_requests.remove(&server_id) {
            request.cancel();
            self.stats.servers_pending -= 1;
        }
    }

    fn on_schedule_pass(&mut self) {
        self.pass_requested = false;
        self.do_schedule();
        let stats = self.stats();
        self.monitoring.borrow_mut().record_scheduler(self.ctx.time(), stats);
    }

    fn on_workload_finished(&mut self, server_id: u64) {
        // The host already retired the guest context.
        let Some(server_rc) = self.servers.get(&server_id).cloned() else {
            return;
        };
        let state = server_rc.borrow().state();
        if state != ServerState::Running {
            return;
        }
        let host_id = server_rc.borrow().host().unwrap();
        let view = self.host_views.get(&host_id).unwrap();
        view.borrow_mut().release(&server_rc.borrow());
        {
            let mut server = server_rc.borrow_mut();
            server.clear_host();
            server.set_state(ServerState::Terminated);
        }
        self.stats.servers_active -= 1;
        log_debug!(self.ctx, "server {} terminated after finishing its work", server_id);
        self.request_schedule();
    }

    fn on_host_state_changed(&mut self, host_id: Id, up: bool) {
        let view = self
            .host_views
            .get(&host_id)
            .unwrap_or_else(|| panic!("unknown host {}", host_id))
            .clone();
        view.borrow_mut().available = up;
        if up {
            self.scheduler.add_host(view);
        } else {
            self.scheduler.remove_host(host_id);
            // Guests died with the host: their servers fail at runtime.
            let placed = self
                .servers
                .values()
                .filter(|s| s.borrow().host() == Some(host_id))
                .cloned()
                .collect::<Vec<_>>();
            for server_rc in placed {
                if server_rc.borrow().state() == ServerState::Running {
                    server_rc.borrow_mut().set_state(ServerState::Error);
                    self.stats.servers_active -= 1;
                }
            }
        }
        self.request_schedule();
    }

    fn resolve_server(&self, id: u64) -> Result<Rc<RefCell<Server>>, ComputeError> {
        if let Some(server) = self.servers.get(&id) {
            return Ok(server.clone());
        }
        if self.deleted_servers.contains(&id) {
            return Err(ComputeError::InvalidState {
                id,
                state: ServerState::Deleted,
            });
        }
        Err(ComputeError::UnknownServer(id))
    }

    fn ensure_open(&self) -> Result<(), ComputeError> {
        if self.closed {
            Err(ComputeError::ServiceClosed)
        } else {
            Ok(())
        }
    }

    fn next_id(&mut self) -> u64 {
        loop {
            let id = self.rng.gen::<u64>() >> 16;
            if !self.servers.contains_key(&id)
                && !self.flavors.contains_key(&id)
                && !self.images.contains_key(&id)
                && !self.deleted_servers.contains(&id)
            {
                return id;
            }
        }
    }
}

impl EventHandler for ComputeService {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            SchedulePass {} => {
                self.on_schedule_pass();
            }
            WorkloadFinished { server_id } => {
                self.on_workload_finished(server_id);
            }
            HostStateChanged { host_id, up } => {
                self.on_host_state_changed(host_id, up);
            }
        });
    }
}
