use std::cell::RefCell;
use std::rc::Rc;

use dslab_core::{cast, Event, EventHandler, Id, Simulation};
use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::Serialize;

use datacenter_sim::config::sim_config::{
    FilterConfig, MonitoringConfig, MultiplexerConfig, SchedulerConfig, SimulationConfig,
};
use datacenter_sim::scheduler::scheduler_from_config;
use datacenter_sim::service::{ComputeError, ComputeService};
use datacenter_sim::{
    ComputeClient, ComputeSimulation, FairShareHypervisor, HostModel, Monitoring, ServerRequest,
    ServerState, ServerWatcher, SimHost,
};

fn simulation() -> ComputeSimulation {
    ComputeSimulation::new(Simulation::new(123), SimulationConfig::default())
}

fn simulation_with_filters(filters: Vec<FilterConfig>) -> ComputeSimulation {
    let config = SimulationConfig {
        scheduler: SchedulerConfig {
            filters,
            ..Default::default()
        },
        ..Default::default()
    };
    ComputeSimulation::new(Simulation::new(123), config)
}

struct TestBed {
    sim: ComputeSimulation,
    host_id: Id,
    flavor: u64,
    image: u64,
}

/// One 4-core host with 8192 MB of memory and a small flavor.
fn test_bed() -> TestBed {
    let mut sim = simulation();
    let host_id = sim.add_host("h1", HostModel::new(4, 1000., 8192));
    let client = sim.client();
    let flavor = client.create_flavor("m1.small", 2, 2048).unwrap();
    let image = client.create_image("base").unwrap();
    TestBed {
        sim,
        host_id,
        flavor,
        image,
    }
}

fn server_request(bed: &TestBed, name: &str, work: Option<f64>) -> ServerRequest {
    ServerRequest {
        name: name.to_string(),
        flavor_id: bed.flavor,
        image_id: bed.image,
        work,
        ..Default::default()
    }
}

#[test]
fn provisioning_is_asynchronous() {
    let mut bed = test_bed();
    let client = bed.sim.client();
    let id = client.create_server(server_request(&bed, "web", None)).unwrap();
    client.start_server(id).unwrap();

    // The request is only queued until the next quantum boundary.
    let info = client.server(id).unwrap().unwrap();
    assert_eq!(info.state, ServerState::Provisioning);
    assert_eq!(info.host, None);

    bed.sim.step_for(2.);
    let info = client.server(id).unwrap().unwrap();
    assert_eq!(info.state, ServerState::Running);
    assert_eq!(info.host, Some(bed.host_id));
    assert_eq!(info.launched_at, Some(1.0));

    let view = bed.sim.service().borrow().host_view(bed.host_id).unwrap();
    let view = view.borrow();
    assert_eq!(view.instance_count, 1);
    assert_eq!(view.available_memory, 8192 - 2048);
    assert_eq!(view.provisioned_cores, 2);
    assert!(view.instances.contains(&id));
}

#[test]
fn stopping_releases_the_reservation() {
    let mut bed = test_bed();
    let client = bed.sim.client();
    let id = client.create_server(server_request(&bed, "web", None)).unwrap();
    client.start_server(id).unwrap();
    bed.sim.step_for(2.);

    client.stop_server(id).unwrap();
    let info = client.server(id).unwrap().unwrap();
    assert_eq!(info.state, ServerState::Terminated);
    assert_eq!(info.host, None);

    let view = bed.sim.service().borrow().host_view(bed.host_id).unwrap();
    let view = view.borrow();
    assert_eq!(view.instance_count, 0);
    assert_eq!(view.available_memory, 8192);
    assert_eq!(view.provisioned_cores, 0);
    assert!(view.instances.is_empty());
}

#[test]
fn oversized_flavor_fails_permanently() {
    let mut bed = test_bed();
    let client = bed.sim.client();
    let huge = client.create_flavor("m1.huge", 64, 262_144).unwrap();
    let id = client
        .create_server(ServerRequest {
            name: "whale".to_string(),
            flavor_id: huge,
            image_id: bed.image,
            ..Default::default()
        })
        .unwrap();
    client.start_server(id).unwrap();
    bed.sim.step_for(2.);

    assert_eq!(client.server(id).unwrap().unwrap().state, ServerState::Terminated);
    let stats = bed.sim.service().borrow().stats();
    assert_eq!(stats.attempts_failure, 1);
    assert_eq!(stats.servers_pending, 0);
}

#[test]
fn core_capacity_is_enforced_without_core_filters() {
    let mut sim = simulation_with_filters(vec![
        FilterConfig::HostUp,
        FilterConfig::Ram { allocation_ratio: 1.0 },
    ]);
    sim.add_host("h1", HostModel::new(4, 1000., 8192));
    let client = sim.client();
    let wide = client.create_flavor("m1.wide", 64, 1024).unwrap();
    let image = client.create_image("base").unwrap();

    let id = client
        .create_server(ServerRequest {
            name: "whale".to_string(),
            flavor_id: wide,
            image_id: image,
            ..Default::default()
        })
        .unwrap();
    client.start_server(id).unwrap();
    sim.step_for(2.);

    // A 64-core guest can never run on a 4-core host, with or without a
    // core filter in the chain.
    assert_eq!(client.server(id).unwrap().unwrap().state, ServerState::Terminated);
    let stats = sim.service().borrow().stats();
    assert_eq!(stats.attempts_failure, 1);
    assert_eq!(stats.attempts_error, 0);
}

#[test]
fn space_shared_placement_waits_for_dedicated_cores() {
    let mut sim = simulation_with_filters(vec![
        FilterConfig::HostUp,
        FilterConfig::Ram { allocation_ratio: 1.0 },
    ]);
    sim.add_host_with(
        "h1",
        HostModel::new(4, 1000., 8192),
        MultiplexerConfig::SpaceShared,
        0.,
        None,
    );
    let client = sim.client();
    let flavor = client.create_flavor("m1.wide", 4, 2048).unwrap();
    let image = client.create_image("base").unwrap();
    let request = |name: &str| ServerRequest {
        name: name.to_string(),
        flavor_id: flavor,
        image_id: image,
        ..Default::default()
    };

    let first = client.create_server(request("first")).unwrap();
    let second = client.create_server(request("second")).unwrap();
    client.start_server(first).unwrap();
    client.start_server(second).unwrap();
    sim.step_for(2.);

    // Without a core filter the second server still passes the chain, but
    // the space-shared multiplexer has no free cores for it.
    assert_eq!(client.server(first).unwrap().unwrap().state, ServerState::Running);
    assert_eq!(client.server(second).unwrap().unwrap().state, ServerState::Provisioning);

    client.stop_server(first).unwrap();
    sim.step_for(2.);
    assert_eq!(client.server(second).unwrap().unwrap().state, ServerState::Running);
}

#[test]
fn queued_request_retries_after_capacity_frees_up() {
    let mut bed = test_bed();
    let client = bed.sim.client();
    let wide = client.create_flavor("m1.wide", 4, 2048).unwrap();
    let request = |name: &str| ServerRequest {
        name: name.to_string(),
        flavor_id: wide,
        image_id: bed.image,
        ..Default::default()
    };

    let first = client.create_server(request("first")).unwrap();
    let second = client.create_server(request("second")).unwrap();
    client.start_server(first).unwrap();
    client.start_server(second).unwrap();
    bed.sim.step_for(2.);

    // Only one wide server fits the 4-core host.
    assert_eq!(client.server(first).unwrap().unwrap().state, ServerState::Running);
    assert_eq!(client.server(second).unwrap().unwrap().state, ServerState::Provisioning);

    client.stop_server(first).unwrap();
    bed.sim.step_for(2.);
    assert_eq!(client.server(second).unwrap().unwrap().state, ServerState::Running);
}

#[test]
fn stopped_request_is_never_placed() {
    let mut bed = test_bed();
    let client = bed.sim.client();
    let wide = client.create_flavor("m1.wide", 4, 2048).unwrap();
    let request = |name: &str| ServerRequest {
        name: name.to_string(),
        flavor_id: wide,
        image_id: bed.image,
        ..Default::default()
    };

    let first = client.create_server(request("first")).unwrap();
    let second = client.create_server(request("second")).unwrap();
    client.start_server(first).unwrap();
    client.start_server(second).unwrap();
    bed.sim.step_for(2.);
    assert_eq!(client.server(second).unwrap().unwrap().state, ServerState::Provisioning);

    // Cancel the queued request, then free the capacity it was waiting for.
    client.stop_server(second).unwrap();
    assert_eq!(client.server(second).unwrap().unwrap().state, ServerState::Terminated);
    client.stop_server(first).unwrap();
    bed.sim.step_for(5.);

    assert_eq!(client.server(second).unwrap().unwrap().state, ServerState::Terminated);
    assert_eq!(bed.sim.service().borrow().stats().attempts_success, 1);
}

#[test]
fn starting_twice_queues_one_request() {
    let bed = test_bed();
    let client = bed.sim.client();
    let id = client.create_server(server_request(&bed, "web", None)).unwrap();
    client.start_server(id).unwrap();
    client.start_server(id).unwrap();

    assert_eq!(bed.sim.service().borrow().queue_len(), 1);
}

#[test]
fn starting_a_deleted_server_is_an_invalid_state() {
    let bed = test_bed();
    let client = bed.sim.client();
    let id = client.create_server(server_request(&bed, "web", None)).unwrap();
    client.delete_server(id).unwrap();

    assert!(matches!(
        client.start_server(id),
        Err(ComputeError::InvalidState {
            state: ServerState::Deleted,
            ..
        })
    ));
    // A reference that never existed is reported differently.
    assert!(matches!(
        client.start_server(12345),
        Err(ComputeError::UnknownServer(12345))
    ));
}

struct Recorder {
    states: RefCell<Vec<ServerState>>,
}

impl ServerWatcher for Recorder {
    fn on_server_state_changed(&self, _server_id: u64, state: ServerState) {
        self.states.borrow_mut().push(state);
    }
}

#[test]
fn watchers_observe_every_transition() {
    let mut bed = test_bed();
    let client = bed.sim.client();
    let id = client.create_server(server_request(&bed, "web", None)).unwrap();
    let recorder = Rc::new(Recorder {
        states: RefCell::new(Vec::new()),
    });
    client.watch_server(id, recorder.clone()).unwrap();

    client.start_server(id).unwrap();
    bed.sim.step_for(2.);
    client.stop_server(id).unwrap();

    assert_eq!(
        *recorder.states.borrow(),
        vec![ServerState::Provisioning, ServerState::Running, ServerState::Terminated]
    );
}

#[test]
fn contending_workloads_share_the_cpu_fairly() {
    let config = SimulationConfig {
        scheduler: SchedulerConfig {
            filters: vec![
                FilterConfig::HostUp,
                FilterConfig::Ram { allocation_ratio: 1.0 },
                FilterConfig::VCpu { allocation_ratio: 2.0 },
            ],
            ..Default::default()
        },
        ..Default::default()
    };
    let mut sim = ComputeSimulation::new(Simulation::new(123), config);
    sim.add_host("h1", HostModel::new(4, 1000., 8192));
    let client = sim.client();
    let flavor = client.create_flavor("m1.wide", 4, 2048).unwrap();
    let image = client.create_image("base").unwrap();

    // Each server needs 4000 units of work on a host delivering 4000/s, so
    // alone it would finish in 1s; sharing the host doubles that.
    let mut ids = Vec::new();
    for name in ["a", "b"] {
        let id = client
            .create_server(ServerRequest {
                name: name.to_string(),
                flavor_id: flavor,
                image_id: image,
                work: Some(4000.),
                ..Default::default()
            })
            .unwrap();
        client.start_server(id).unwrap();
        ids.push(id);
    }

    // Both are placed at t=1 and run until t=3.
    sim.step_for(2.5);
    for id in &ids {
        assert_eq!(client.server(*id).unwrap().unwrap().state, ServerState::Running);
    }
    sim.step_for(1.);
    for id in &ids {
        assert_eq!(client.server(*id).unwrap().unwrap().state, ServerState::Terminated);
    }
    let stats = sim.service().borrow().stats();
    assert_eq!(stats.attempts_success, 2);
    assert_eq!(stats.servers_active, 0);
}

#[test]
fn host_failure_moves_running_servers_to_error() {
    let mut bed = test_bed();
    let client = bed.sim.client();
    let id = client.create_server(server_request(&bed, "web", None)).unwrap();
    client.start_server(id).unwrap();
    bed.sim.step_for(2.);

    bed.sim.set_host_state(bed.host_id, false);
    bed.sim.step_for(1.);

    assert_eq!(client.server(id).unwrap().unwrap().state, ServerState::Error);
    let stats = bed.sim.service().borrow().stats();
    assert_eq!(stats.hosts_available, 0);
    assert_eq!(stats.hosts_unavailable, 1);
    assert_eq!(stats.servers_active, 0);

    // Restarting an errored server is rejected; deleting it releases the
    // capacity it still held.
    assert!(matches!(
        client.start_server(id),
        Err(ComputeError::InvalidState {
            state: ServerState::Error,
            ..
        })
    ));
    client.delete_server(id).unwrap();
    let view = bed.sim.service().borrow().host_view(bed.host_id).unwrap();
    assert_eq!(view.borrow().instance_count, 0);
    assert_eq!(view.borrow().available_memory, 8192);
}

#[test]
fn request_waits_for_a_downed_host_to_return() {
    let mut bed = test_bed();
    bed.sim.set_host_state(bed.host_id, false);
    bed.sim.step_for(1.);

    let client = bed.sim.client();
    let id = client.create_server(server_request(&bed, "web", None)).unwrap();
    client.start_server(id).unwrap();
    bed.sim.step_for(2.);

    // The only capable host is down, which is not a permanent failure.
    assert_eq!(client.server(id).unwrap().unwrap().state, ServerState::Provisioning);
    assert_eq!(bed.sim.service().borrow().stats().attempts_failure, 0);

    bed.sim.set_host_state(bed.host_id, true);
    bed.sim.step_for(2.);
    assert_eq!(client.server(id).unwrap().unwrap().state, ServerState::Running);
}

#[test]
fn infeasible_request_fails_even_while_hosts_are_down() {
    let mut sim = simulation_with_filters(vec![
        FilterConfig::HostUp,
        FilterConfig::Ram { allocation_ratio: 0.5 },
    ]);
    let host_id = sim.add_host("h1", HostModel::new(4, 1000., 8192));
    sim.set_host_state(host_id, false);
    sim.step_for(1.);

    let client = sim.client();
    let heavy = client.create_flavor("m1.heavy", 2, 6000).unwrap();
    let light = client.create_flavor("m1.light", 2, 2048).unwrap();
    let image = client.create_image("base").unwrap();
    let request = |name: &str, flavor_id: u64| ServerRequest {
        name: name.to_string(),
        flavor_id,
        image_id: image,
        ..Default::default()
    };

    let hopeless = client.create_server(request("hopeless", heavy)).unwrap();
    let waiting = client.create_server(request("waiting", light)).unwrap();
    client.start_server(hopeless).unwrap();
    client.start_server(waiting).unwrap();
    sim.step_for(2.);

    // 6000 MB can never pass the 0.5 ratio even on an idle host, so a host
    // outage must not keep the request alive; 2048 MB would fit once the
    // host is back, so that one stays queued.
    assert_eq!(client.server(hopeless).unwrap().unwrap().state, ServerState::Terminated);
    assert_eq!(client.server(waiting).unwrap().unwrap().state, ServerState::Provisioning);
    assert_eq!(sim.service().borrow().stats().attempts_failure, 1);

    sim.set_host_state(host_id, true);
    sim.step_for(2.);
    assert_eq!(client.server(waiting).unwrap().unwrap().state, ServerState::Running);
}

#[derive(Clone, Serialize)]
struct BreakHost {}

struct HostBreaker {
    host: Rc<RefCell<SimHost>>,
}

impl EventHandler for HostBreaker {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            BreakHost {} => {
                self.host.borrow_mut().set_up(false);
            }
        });
    }
}

#[test]
fn failed_deployment_moves_the_server_to_error() {
    let mut sim = Simulation::new(123);
    let monitoring = Rc::new(RefCell::new(Monitoring::new(MonitoringConfig::default())));
    let sched_config = SchedulerConfig::default();
    let scheduler = scheduler_from_config(&sched_config, sched_config.seed);
    let service_ctx = sim.create_context("compute-service");
    let service = Rc::new(RefCell::new(ComputeService::new(
        service_ctx,
        scheduler,
        monitoring.clone(),
        sched_config.quantum,
        Pcg64::seed_from_u64(sched_config.seed),
    )));
    sim.add_handler("compute-service", service.clone());

    let host_ctx = sim.create_context("host-h1");
    let host = Rc::new(RefCell::new(SimHost::new(
        host_ctx,
        HostModel::new(4, 1000., 8192),
        Box::new(FairShareHypervisor::new(4, 1000., 0.)),
        monitoring,
        None,
    )));
    sim.add_handler("host-h1", host.clone());
    host.borrow_mut().set_service(service.borrow().id());
    let host_id = service.borrow_mut().add_host(host.clone());

    // The host dies at the exact instant of the scheduling pass, after the
    // eligibility snapshot was taken but before the service learns of it.
    let chaos_ctx = sim.create_context("chaos");
    let breaker = Rc::new(RefCell::new(HostBreaker { host: host.clone() }));
    sim.add_handler("chaos", breaker);
    chaos_ctx.emit(BreakHost {}, chaos_ctx.id(), 1.0);

    let client = ComputeClient::new(service.clone());
    let flavor = client.create_flavor("m1.small", 2, 2048).unwrap();
    let image = client.create_image("base").unwrap();
    let mut ids = Vec::new();
    for name in ["a", "b"] {
        let id = client
            .create_server(ServerRequest {
                name: name.to_string(),
                flavor_id: flavor,
                image_id: image,
                ..Default::default()
            })
            .unwrap();
        client.start_server(id).unwrap();
        ids.push(id);
    }

    sim.step_until_no_events();

    // Both deployments error, and the first failure does not stop the cycle
    // from processing the second request.
    for id in &ids {
        assert_eq!(client.server(*id).unwrap().unwrap().state, ServerState::Error);
    }
    let stats = service.borrow().stats();
    assert_eq!(stats.attempts_error, 2);
    assert_eq!(stats.attempts_success, 0);
    assert_eq!(stats.servers_pending, 0);

    // Errored servers keep their reservation until they are deleted.
    let view = service.borrow().host_view(host_id).unwrap();
    assert_eq!(view.borrow().instance_count, 2);
    for id in ids {
        client.delete_server(id).unwrap();
    }
    assert_eq!(view.borrow().instance_count, 0);
    assert_eq!(view.borrow().available_memory, 8192);
}

#[test]
fn closed_sessions_reject_operations() {
    let bed = test_bed();
    let client = bed.sim.client();
    client.close();
    assert!(matches!(
        client.create_flavor("m1.small", 1, 512),
        Err(ComputeError::ClientClosed)
    ));

    // Other sessions stay usable until the service itself closes.
    let other = bed.sim.client();
    assert!(other.create_flavor("m1.small", 1, 512).is_ok());
    bed.sim.service().borrow_mut().close();
    assert!(matches!(
        other.create_flavor("m1.small", 1, 512),
        Err(ComputeError::ServiceClosed)
    ));
}

#[test]
fn create_server_validates_references() {
    let bed = test_bed();
    let client = bed.sim.client();
    assert!(matches!(
        client.create_server(ServerRequest {
            name: "web".to_string(),
            flavor_id: 999,
            image_id: bed.image,
            ..Default::default()
        }),
        Err(ComputeError::UnknownFlavor(999))
    ));
    assert!(matches!(
        client.create_server(ServerRequest {
            name: "web".to_string(),
            flavor_id: bed.flavor,
            image_id: 999,
            ..Default::default()
        }),
        Err(ComputeError::UnknownImage(999))
    ));
}

#[test]
fn servers_are_found_by_name() {
    let bed = test_bed();
    let client = bed.sim.client();
    let id = client.create_server(server_request(&bed, "web", None)).unwrap();

    let info = client.find_server("web").unwrap().unwrap();
    assert_eq!(info.id, id);
    assert!(client.find_server("missing").unwrap().is_none());
}
