//! Scoring functions used to rank eligible hosts.
//!
//! Every weigher carries a signed multiplier, so the same dimension can be
//! favored or penalized depending on the packing policy.

use crate::entities::Server;
use crate::host::HostView;

pub trait HostWeigher {
    fn weigh(&self, host: &HostView, server: &Server) -> f64;
}

/// Scores by available memory; positive multipliers spread load, negative
/// ones pack it.
pub struct RamWeigher {
    multiplier: f64,
}

impl RamWeigher {
    pub fn new(multiplier: f64) -> Self {
        RamWeigher { multiplier }
    }
}

impl HostWeigher for RamWeigher {
    fn weigh(&self, host: &HostView, _server: &Server) -> f64 {
        self.multiplier * host.available_memory as f64
    }
}

/// Scores by the host's core-to-memory ratio.
pub struct CoreRamWeigher {
    multiplier: f64,
}

impl CoreRamWeigher {
    pub fn new(multiplier: f64) -> Self {
        CoreRamWeigher { multiplier }
    }
}

impl HostWeigher for CoreRamWeigher {
    fn weigh(&self, host: &HostView, _server: &Server) -> f64 {
        self.multiplier * host.model.core_count as f64 / host.model.memory_capacity.max(1) as f64
    }
}

/// Scores by provisioned core count; usually configured with a negative
/// multiplier to steer away from loaded hosts.
pub struct VCpuWeigher {
    multiplier: f64,
}

impl VCpuWeigher {
    pub fn new(multiplier: f64) -> Self {
        VCpuWeigher { multiplier }
    }
}

impl HostWeigher for VCpuWeigher {
    fn weigh(&self, host: &HostView, _server: &Server) -> f64 {
        self.multiplier * host.provisioned_cores as f64
    }
}

/// Scores by the number of instances on the host.
pub struct InstanceCountWeigher {
    multiplier: f64,
}

impl InstanceCountWeigher {
    pub fn new(multiplier: f64) -> Self {
        InstanceCountWeigher { multiplier }
    }
}

impl HostWeigher for InstanceCountWeigher {
    fn weigh(&self, host: &HostView, _server: &Server) -> f64 {
        self.multiplier * host.instance_count as f64
    }
}
