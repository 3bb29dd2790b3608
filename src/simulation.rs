use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use dslab_core::{Id, Simulation};
use rand::SeedableRng;
use rand_pcg::Pcg64;
use rustc_hash::FxHashMap;
use sugars::{boxed, rc, refcell};

use crate::client::ComputeClient;
use crate::config::sim_config::{GroupHostConfig, MultiplexerConfig, SimulationConfig};
use crate::host::{FairShareHypervisor, HostModel, Hypervisor, SimHost, SpaceSharedHypervisor};
use crate::monitoring::Monitoring;
use crate::scheduler::scheduler_from_config;
use crate::service::ComputeService;

/// Wires the compute service, hosts and telemetry onto a discrete-event
/// simulation and drives it.
pub struct ComputeSimulation {
    sim: Simulation,
    service: Rc<RefCell<ComputeService>>,
    monitoring: Rc<RefCell<Monitoring>>,
    hosts: FxHashMap<Id, Rc<RefCell<SimHost>>>,
}

impl ComputeSimulation {
    pub fn new(mut sim: Simulation, config: SimulationConfig) -> ComputeSimulation {
        let monitoring = rc!(refcell!(Monitoring::new(config.monitoring.clone())));

        let scheduler = scheduler_from_config(&config.scheduler, config.scheduler.seed);
        let service_ctx = sim.create_context("compute-service");
        let service = rc!(refcell!(ComputeService::new(
            service_ctx,
            scheduler,
            monitoring.clone(),
            config.scheduler.quantum,
            Pcg64::seed_from_u64(config.scheduler.seed),
        )));
        sim.add_handler("compute-service", service.clone());

        let mut simulation = ComputeSimulation {
            sim,
            service,
            monitoring,
            hosts: FxHashMap::default(),
        };

        for group in &config.hosts {
            simulation.build_host_group(group);
        }

        simulation
    }

    fn build_host_group(&mut self, group: &GroupHostConfig) {
        let count = group.count.unwrap_or(1);
        for i in 0..count {
            let name = if count == 1 {
                group.name_prefix.clone()
            } else {
                format!("{}-{}", group.name_prefix, i)
            };
            let mut model = HostModel::new(group.cpus, group.cpu_speed.unwrap_or(1000.), group.memory);
            if let Some(gpus) = group.gpus {
                model = model.with_gpu(gpus);
            }
            self.add_host_with(
                &name,
                model,
                group.multiplexer,
                group.interference_penalty.unwrap_or(0.),
                group.stats_interval,
            );
        }
    }

    /// Adds a fair-share host without interference or periodic flow stats.
    pub fn add_host(&mut self, name: &str, model: HostModel) -> Id {
        self.add_host_with(name, model, MultiplexerConfig::FairShare, 0., None)
    }

    pub fn add_host_with(
        &mut self,
        name: &str,
        model: HostModel,
        multiplexer: MultiplexerConfig,
        interference_penalty: f64,
        stats_interval: Option<f64>,
    ) -> Id {
        let host_name = format!("host-{}", name);
        let host_ctx = self.sim.create_context(&host_name);

        let hypervisor: Box<dyn Hypervisor> = match multiplexer {
            MultiplexerConfig::FairShare => boxed!(FairShareHypervisor::new(
                model.core_count,
                model.core_speed,
                interference_penalty,
            )),
            MultiplexerConfig::SpaceShared => {
                boxed!(SpaceSharedHypervisor::new(model.core_count, model.core_speed))
            }
        };

        let host = rc!(refcell!(SimHost::new(
            host_ctx,
            model,
            hypervisor,
            self.monitoring.clone(),
            stats_interval,
        )));
        self.sim.add_handler(&host_name, host.clone());

        host.borrow_mut().set_service(self.service.borrow().id());
        host.borrow_mut().start();

        let id = self.service.borrow_mut().add_host(host.clone());
        self.hosts.insert(id, host);
        id
    }

    /// Flips a host up or down; the service reacts on the next event.
    pub fn set_host_state(&mut self, host_id: Id, up: bool) {
        self.hosts
            .get(&host_id)
            .unwrap_or_else(|| panic!("unknown host {}", host_id))
            .borrow_mut()
            .set_up(up);
    }

    /// Opens a new client session.
    pub fn client(&self) -> ComputeClient {
        ComputeClient::new(self.service.clone())
    }

    pub fn service(&self) -> Rc<RefCell<ComputeService>> {
        self.service.clone()
    }

    pub fn monitoring(&self) -> Rc<RefCell<Monitoring>> {
        self.monitoring.clone()
    }

    pub fn time(&self) -> f64 {
        self.sim.time()
    }

    /// Advances the simulation by the given amount of simulated time.
    pub fn step_for(&mut self, duration: f64) {
        self.sim.step_for_duration(duration);
    }

    pub fn run(&mut self) {
        let t = Instant::now();
        println!("Simulation started");

        self.sim.step_until_no_events();

        let elapsed = t.elapsed().as_secs_f64();
        let stats = self.service.borrow().stats();
        println!("Simulation finished in {:.3}s", elapsed);
        println!("Simulated time: {}", self.sim.time());
        println!(
            "Processed {} events: {}/s",
            self.sim.event_count(),
            (self.sim.event_count() as f64 / elapsed) as u64
        );
        println!(
            "Attempts: {} succeeded, {} failed, {} errored",
            stats.attempts_success, stats.attempts_failure, stats.attempts_error
        );
    }
}
