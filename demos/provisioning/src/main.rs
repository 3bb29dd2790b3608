use std::io::Write;

use env_logger::Builder;

use datacenter_sim::config::sim_config::SimulationConfig;
use datacenter_sim::{ComputeSimulation, ServerRequest};
use dslab_core::Simulation;

fn main() {
    Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    let sim = Simulation::new(42);
    let config = SimulationConfig::from_file("configs/config.yaml");
    let mut compute_sim = ComputeSimulation::new(sim, config);

    let client = compute_sim.client();
    let small = client.create_flavor("m1.small", 2, 2048).unwrap();
    let large = client.create_flavor("m1.large", 16, 32768).unwrap();
    let image = client.create_image("ubuntu-24.04").unwrap();

    for i in 0..24 {
        let flavor_id = if i % 4 == 0 { large } else { small };
        let server = client
            .create_server(ServerRequest {
                name: format!("worker-{}", i),
                flavor_id,
                image_id: image,
                work: Some(50_000. * (i + 1) as f64),
                ..Default::default()
            })
            .unwrap();
        client.start_server(server).unwrap();
    }

    compute_sim.run();
}
