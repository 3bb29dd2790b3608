//! Telemetry sink for scheduler and per-host flow statistics.
//!
//! Samples are kept in memory for programmatic access and, when an output
//! directory is configured, appended as JSON lines.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};

use serde::Serialize;

use crate::config::sim_config::MonitoringConfig;
use crate::host::FlowStats;
use crate::service::SchedulerStats;

#[derive(Serialize)]
struct SchedulerSample<'a> {
    time: f64,
    #[serde(flatten)]
    stats: &'a SchedulerStats,
}

#[derive(Serialize)]
struct FlowSample<'a> {
    time: f64,
    host: &'a str,
    #[serde(flatten)]
    stats: &'a FlowStats,
}

pub struct Monitoring {
    scheduler_samples: Vec<(f64, SchedulerStats)>,
    flow_samples: HashMap<String, Vec<(f64, FlowStats)>>,

    scheduler_log: Option<BufWriter<File>>,
    flow_log: Option<BufWriter<File>>,
}

impl Monitoring {
    pub fn new(config: MonitoringConfig) -> Monitoring {
        let (scheduler_log, flow_log) = match &config.output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .unwrap_or_else(|e| panic!("Can't create output dir {}: {}", dir, e));
                let open = |name: &str| {
                    let path = format!("{}/{}", dir, name);
                    BufWriter::new(
                        File::create(&path)
                            .unwrap_or_else(|e| panic!("Can't create file {}: {}", path, e)),
                    )
                };
                (
                    Some(open("scheduler_stats.jsonl")),
                    Some(open("flow_stats.jsonl")),
                )
            }
            None => (None, None),
        };
        Monitoring {
            scheduler_samples: Vec::new(),
            flow_samples: HashMap::new(),
            scheduler_log,
            flow_log,
        }
    }

    pub fn record_scheduler(&mut self, time: f64, stats: SchedulerStats) {
        if let Some(log) = &mut self.scheduler_log {
            let line = serde_json::to_string(&SchedulerSample { time, stats: &stats }).unwrap();
            writeln!(log, "{}", line).unwrap();
        }
        self.scheduler_samples.push((time, stats));
    }

    pub fn record_flow(&mut self, time: f64, host: &str, stats: FlowStats) {
        if let Some(log) = &mut self.flow_log {
            let line = serde_json::to_string(&FlowSample { time, host, stats: &stats }).unwrap();
            writeln!(log, "{}", line).unwrap();
        }
        self.flow_samples
            .entry(host.to_string())
            .or_default()
            .push((time, stats));
    }

    pub fn last_scheduler_stats(&self) -> Option<&SchedulerStats> {
        self.scheduler_samples.last().map(|(_, s)| s)
    }

    pub fn scheduler_samples(&self) -> &[(f64, SchedulerStats)] {
        &self.scheduler_samples
    }

    pub fn flow_samples(&self, host: &str) -> &[(f64, FlowStats)] {
        self.flow_samples.get(host).map(|v| v.as_slice()).unwrap_or(&[])
    }
}
