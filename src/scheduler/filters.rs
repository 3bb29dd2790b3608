//! Hard predicates a host must satisfy to stay a placement candidate.

use crate::entities::server::{DIFFERENT_HOST_HINT, SAME_HOST_HINT};
use crate::entities::Server;
use crate::host::{HostModel, HostView};

/// A host must pass every configured filter to remain eligible.
///
/// `passes_idle_host` re-runs the capacity check against a completely free
/// host; it separates "will never fit" (scheduling failure) from "does not
/// fit right now" (retry later).
pub trait HostFilter {
    fn test(&self, host: &HostView, server: &Server) -> bool;

    fn passes_idle_host(&self, _model: &HostModel, _server: &Server) -> bool {
        true
    }
}

/// Keeps only hosts in the up state.
pub struct HostUpFilter;

impl HostFilter for HostUpFilter {
    fn test(&self, host: &HostView, _server: &Server) -> bool {
        host.available
    }
}

/// Memory capacity filter with an allocation (overcommit) ratio.
///
/// A server is never allowed to overcommit against itself: a flavor larger
/// than the host's physical memory fails regardless of the ratio.
pub struct RamFilter {
    allocation_ratio: f64,
}

impl RamFilter {
    pub fn new(allocation_ratio: f64) -> Self {
        RamFilter { allocation_ratio }
    }
}

impl HostFilter for RamFilter {
    fn test(&self, host: &HostView, server: &Server) -> bool {
        let requested = server.flavor.memory_size as f64;
        let total = host.model.memory_capacity as f64;
        if requested > total {
            return false;
        }
        let usable = total * self.allocation_ratio - host.used_memory() as f64;
        requested <= usable
    }

    fn passes_idle_host(&self, model: &HostModel, server: &Server) -> bool {
        let requested = server.flavor.memory_size as f64;
        let total = model.memory_capacity as f64;
        requested <= total && requested <= total * self.allocation_ratio
    }
}

/// Provisioned-core ratio filter with an overcommit factor.
pub struct VCpuFilter {
    allocation_ratio: f64,
}

impl VCpuFilter {
    pub fn new(allocation_ratio: f64) -> Self {
        VCpuFilter { allocation_ratio }
    }
}

impl HostFilter for VCpuFilter {
    fn test(&self, host: &HostView, server: &Server) -> bool {
        let requested = server.flavor.core_count as f64;
        let usable =
            host.model.core_count as f64 * self.allocation_ratio - host.provisioned_cores as f64;
        requested <= usable
    }

    fn passes_idle_host(&self, model: &HostModel, server: &Server) -> bool {
        server.flavor.core_count as f64 <= model.core_count as f64 * self.allocation_ratio
    }
}

/// Caps the number of instances placed on one host.
pub struct InstanceCountFilter {
    max_instance_count: u32,
}

impl InstanceCountFilter {
    pub fn new(max_instance_count: u32) -> Self {
        InstanceCountFilter { max_instance_count }
    }
}

impl HostFilter for InstanceCountFilter {
    fn test(&self, host: &HostView, _server: &Server) -> bool {
        host.instance_count < self.max_instance_count
    }

    fn passes_idle_host(&self, _model: &HostModel, _server: &Server) -> bool {
        self.max_instance_count >= 1
    }
}

/// Accelerator capacity filter. Flavors that request no accelerator cores
/// pass everywhere, including hosts without an accelerator.
pub struct AcceleratorFilter;

impl HostFilter for AcceleratorFilter {
    fn test(&self, host: &HostView, server: &Server) -> bool {
        let requested = server.flavor.gpu_core_count();
        if requested == 0 {
            return true;
        }
        match &host.model.gpu {
            Some(gpu) => requested + host.provisioned_gpu_cores <= gpu.core_count,
            None => false,
        }
    }

    fn passes_idle_host(&self, model: &HostModel, server: &Server) -> bool {
        let requested = server.flavor.gpu_core_count();
        requested == 0 || model.gpu.as_ref().is_some_and(|gpu| requested <= gpu.core_count)
    }
}

/// Same-host affinity: every hinted server must already be running on this
/// host. A hint naming a server that is not placed anywhere keeps the
/// request queued until that server lands.
pub struct SameHostFilter;

impl HostFilter for SameHostFilter {
    fn test(&self, host: &HostView, server: &Server) -> bool {
        server
            .scheduler_hints(SAME_HOST_HINT)
            .iter()
            .all(|id| host.instances.contains(id))
    }
}

/// Different-host anti-affinity: none of the hinted servers may run here.
pub struct DifferentHostFilter;

impl HostFilter for DifferentHostFilter {
    fn test(&self, host: &HostView, server: &Server) -> bool {
        !server
            .scheduler_hints(DIFFERENT_HOST_HINT)
            .iter()
            .any(|id| host.instances.contains(id))
    }
}
