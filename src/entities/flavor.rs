use std::collections::HashMap;

use serde::Serialize;

/// Meta key holding the number of accelerator cores a flavor requests.
pub const ACCEL_CORES_META: &str = "accel:cores";

/// Resource shape requested for a server: core count, memory size and
/// free-form labels/metadata. Flavors are immutable once created; deletion
/// only removes them from the service registry.
#[derive(Clone, Serialize)]
pub struct Flavor {
    pub id: u64,
    pub name: String,
    pub core_count: u32,
    pub memory_size: u64,
    pub labels: HashMap<String, String>,
    pub meta: HashMap<String, String>,
}

impl Flavor {
    pub fn new(id: u64, name: String, core_count: u32, memory_size: u64) -> Self {
        Flavor {
            id,
            name,
            core_count,
            memory_size,
            labels: HashMap::new(),
            meta: HashMap::new(),
        }
    }

    /// Accelerator cores requested through flavor metadata, 0 when absent.
    pub fn gpu_core_count(&self) -> u32 {
        self.meta
            .get(ACCEL_CORES_META)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}
