use std::fs;

use datacenter_sim::config::sim_config::MonitoringConfig;
use datacenter_sim::host::FlowStats;
use datacenter_sim::service::SchedulerStats;
use datacenter_sim::Monitoring;

#[test]
fn samples_are_kept_in_memory_and_dumped_as_json_lines() {
    let dir = std::env::temp_dir().join("datacenter-sim-monitoring-test");
    let _ = fs::remove_dir_all(&dir);
    {
        let mut monitoring = Monitoring::new(MonitoringConfig {
            output_dir: Some(dir.to_str().unwrap().to_string()),
        });
        monitoring.record_scheduler(
            1.0,
            SchedulerStats {
                attempts_success: 3,
                ..Default::default()
            },
        );
        monitoring.record_flow(
            10.0,
            "host-h1",
            FlowStats {
                requested: 100.,
                granted: 80.,
                ..Default::default()
            },
        );
        assert_eq!(monitoring.scheduler_samples().len(), 1);
        assert_eq!(monitoring.flow_samples("host-h1").len(), 1);
        assert!(monitoring.flow_samples("host-h2").is_empty());
    }

    let dump = fs::read_to_string(dir.join("scheduler_stats.jsonl")).unwrap();
    let line: serde_json::Value = serde_json::from_str(dump.lines().next().unwrap()).unwrap();
    assert_eq!(line["time"], 1.0);
    assert_eq!(line["attempts_success"], 3);

    let dump = fs::read_to_string(dir.join("flow_stats.jsonl")).unwrap();
    let line: serde_json::Value = serde_json::from_str(dump.lines().next().unwrap()).unwrap();
    assert_eq!(line["host"], "host-h1");
    assert_eq!(line["granted"], 80.0);

    let _ = fs::remove_dir_all(&dir);
}
