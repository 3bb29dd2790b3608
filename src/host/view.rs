use dslab_core::Id;
use rustc_hash::FxHashSet;

use crate::entities::Server;

use super::HostModel;

/// Scheduler-facing live snapshot of a host's capacity.
///
/// Counters are mutated only on successful placement and on server
/// termination, and each reservation is released exactly once.
/// `available_memory` is signed because memory overcommit (allocation ratio
/// above 1.0) intentionally drives it below zero; with a ratio of 1.0 the
/// `RamFilter` keeps it non-negative.
pub struct HostView {
    pub host_id: Id,
    pub name: String,
    pub model: HostModel,
    pub available: bool,
    pub instance_count: u32,
    pub available_memory: i64,
    pub provisioned_cores: u32,
    pub provisioned_gpu_cores: u32,
    /// Ids of servers currently placed on the host, used by affinity filters.
    pub instances: FxHashSet<u64>,
}

impl HostView {
    pub fn new(host_id: Id, name: String, model: HostModel) -> Self {
        let available_memory = model.memory_capacity as i64;
        HostView {
            host_id,
            name,
            model,
            available: true,
            instance_count: 0,
            available_memory,
            provisioned_cores: 0,
            provisioned_gpu_cores: 0,
            instances: FxHashSet::default(),
        }
    }

    /// Memory currently reserved on the host.
    pub fn used_memory(&self) -> i64 {
        self.model.memory_capacity as i64 - self.available_memory
    }

    pub(crate) fn provision(&mut self, server: &Server) {
        let flavor = &server.flavor;
        self.instance_count += 1;
        self.available_memory -= flavor.memory_size as i64;
        self.provisioned_cores += flavor.core_count;
        self.provisioned_gpu_cores += flavor.gpu_core_count();
        self.instances.insert(server.id);
    }

    pub(crate) fn release(&mut self, server: &Server) {
        let flavor = &server.flavor;
        assert!(
            self.instances.remove(&server.id),
            "server {} is not placed on host {}",
            server.id,
            self.name
        );
        self.instance_count -= 1;
        self.available_memory += flavor.memory_size as i64;
        self.provisioned_cores -= flavor.core_count;
        self.provisioned_gpu_cores -= flavor.gpu_core_count();
    }
}
