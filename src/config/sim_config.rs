//! YAML simulation config.

use serde::{Deserialize, Serialize};

/// Host group: `count` identical hosts sharing one capacity model.
#[derive(Serialize, Deserialize, Clone)]
pub struct GroupHostConfig {
    pub name_prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    pub cpus: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_speed: Option<f64>,
    pub memory: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,
    #[serde(default)]
    pub multiplexer: MultiplexerConfig,
    /// Per-host interference penalty applied under contention, 0 disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interference_penalty: Option<f64>,
    /// Flow-stats reporting period; no periodic reporting when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats_interval: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum MultiplexerConfig {
    #[default]
    FairShare,
    SpaceShared,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FilterConfig {
    HostUp,
    Ram { allocation_ratio: f64 },
    VCpu { allocation_ratio: f64 },
    InstanceCount { max_instance_count: u32 },
    Accelerator,
    SameHost,
    DifferentHost,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WeigherConfig {
    Ram { multiplier: f64 },
    CoreRam { multiplier: f64 },
    VCpu { multiplier: f64 },
    InstanceCount { multiplier: f64 },
}

#[derive(Serialize, Deserialize, Clone)]
pub struct TimeShiftConfig {
    /// Bounded look-ahead from request submission.
    pub window: f64,
    /// Cluster core utilization above which deferrable servers wait.
    pub utilization_threshold: f64,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_filters")]
    pub filters: Vec<FilterConfig>,
    #[serde(default = "default_weighers")]
    pub weighers: Vec<WeigherConfig>,
    /// Placement is drawn uniformly from the top `subset_size` candidates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subset_size: Option<usize>,
    /// Scheduling quantum pacing the coalesced cycles.
    #[serde(default = "default_quantum")]
    pub quantum: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_times_skipped: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_shift: Option<TimeShiftConfig>,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_filters() -> Vec<FilterConfig> {
    vec![
        FilterConfig::HostUp,
        FilterConfig::Ram {
            allocation_ratio: 1.0,
        },
        FilterConfig::VCpu {
            allocation_ratio: 1.0,
        },
        FilterConfig::Accelerator,
    ]
}

fn default_weighers() -> Vec<WeigherConfig> {
    vec![WeigherConfig::Ram { multiplier: 1.0 }]
}

fn default_quantum() -> f64 {
    1.0
}

fn default_seed() -> u64 {
    42
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            filters: default_filters(),
            weighers: default_weighers(),
            subset_size: None,
            quantum: default_quantum(),
            max_times_skipped: None,
            time_shift: None,
            seed: default_seed(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Default)]
pub struct MonitoringConfig {
    /// Directory for telemetry dumps; in-memory only when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Default)]
pub struct SimulationConfig {
    #[serde(default)]
    pub hosts: Vec<GroupHostConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl SimulationConfig {
    pub fn from_file(file_name: &str) -> Self {
        serde_yaml::from_str(
            &std::fs::read_to_string(file_name)
                .unwrap_or_else(|_| panic!("Can't read file {}", file_name)),
        )
        .unwrap_or_else(|reason| panic!("Can't parse YAML from file {}: {}", file_name, reason))
    }
}
