use rustc_hash::FxHashMap;
use serde::Serialize;

const EPS: f64 = 1e-9;

/// Per-period aggregates of the CPU flow through a hypervisor, in units of
/// work: what guests asked for, what they received, demand beyond capacity,
/// and capacity lost to performance interference.
#[derive(Clone, Copy, Default, Serialize, Debug)]
pub struct FlowStats {
    pub requested: f64,
    pub granted: f64,
    pub overcommitted: f64,
    pub interfered: f64,
}

/// Multiplexes host CPU capacity among per-guest resource contexts.
///
/// Admitting a context that does not fit (`can_fit` returns false) is a
/// programming error and panics; callers are expected to check first.
pub trait Hypervisor {
    /// Whether a guest spanning `core_count` cores can be admitted.
    fn can_fit(&self, core_count: u32) -> bool;

    /// Registers a guest context with a dedicated output on the switch.
    /// The context starts with zero demand.
    fn create_context(&mut self, server_id: u64, core_count: u32);

    /// Updates the CPU demand (work units per second) of a guest context
    /// and redistributes capacity.
    fn set_demand(&mut self, server_id: u64, demand: f64);

    /// Retires a guest context and releases its switch output.
    fn remove_context(&mut self, server_id: u64);

    /// Work rate currently granted to a guest context.
    fn granted_rate(&self, server_id: u64) -> f64;

    /// Accumulates flow aggregates up to `now` with the current rates.
    fn advance(&mut self, now: f64);

    /// Returns the aggregates accumulated since the previous flush.
    fn flush_stats(&mut self) -> FlowStats;

    fn context_count(&self) -> usize;
}

struct FlowContext {
    core_count: u32,
    /// Demanded work rate, capped by the context's own core allotment.
    demand: f64,
    granted: f64,
    interference_loss: f64,
}

/// Fair-share hypervisor: divides contended CPU capacity proportionally
/// (max-min) among active contexts every time the demand changes.
///
/// When total demand exceeds capacity, an interference penalty scales down
/// every grant and the lost work is reported separately.
pub struct FairShareHypervisor {
    core_count: u32,
    core_speed: f64,
    capacity: f64,
    interference_penalty: f64,
    contexts: FxHashMap<u64, FlowContext>,
    stats: FlowStats,
    last_advance: f64,
}

impl FairShareHypervisor {
    pub fn new(core_count: u32, core_speed: f64, interference_penalty: f64) -> Self {
        assert!(
            (0. ..1.).contains(&interference_penalty),
            "interference penalty must be in [0, 1)"
        );
        FairShareHypervisor {
            core_count,
            core_speed,
            capacity: core_count as f64 * core_speed,
            interference_penalty,
            contexts: FxHashMap::default(),
            stats: FlowStats::default(),
            last_advance: 0.,
        }
    }

    /// Max-min division of capacity among current demands.
    fn redistribute(&mut self) {
        let total_demand: f64 = self.contexts.values().map(|c| c.demand).sum();

        let mut ids = self.contexts.keys().copied().collect::<Vec<_>>();
        ids.sort_by(|a, b| {
            let da = self.contexts[a].demand;
            let db = self.contexts[b].demand;
            da.partial_cmp(&db).unwrap().then(a.cmp(b))
        });

        let mut remaining = self.capacity;
        let mut left = ids.len();
        let contended = total_demand > self.capacity + EPS;
        for id in ids {
            let share = remaining / left as f64;
            let context = self.contexts.get_mut(&id).unwrap();
            let mut granted = context.demand.min(share);
            remaining -= granted;
            left -= 1;

            context.interference_loss = if contended {
                let loss = granted * self.interference_penalty;
                granted -= loss;
                loss
            } else {
                0.
            };
            context.granted = granted;
        }
    }
}

impl Hypervisor for FairShareHypervisor {
    fn can_fit(&self, core_count: u32) -> bool {
        core_count <= self.core_count
    }

    fn create_context(&mut self, server_id: u64, core_count: u32) {
        assert!(
            self.can_fit(core_count),
            "guest {} spans {} cores, host switch has {}",
            server_id,
            core_count,
            self.core_count
        );
        let prev = self.contexts.insert(
            server_id,
            FlowContext {
                core_count,
                demand: 0.,
                granted: 0.,
                interference_loss: 0.,
            },
        );
        assert!(prev.is_none(), "guest {} already has a context", server_id);
        self.redistribute();
    }

    fn set_demand(&mut self, server_id: u64, demand: f64) {
        let context = self
            .contexts
            .get_mut(&server_id)
            .unwrap_or_else(|| panic!("guest {} has no context", server_id));
        context.demand = demand.min(context.core_count as f64 * self.core_speed);
        self.redistribute();
    }

    fn remove_context(&mut self, server_id: u64) {
        self.contexts.remove(&server_id);
        self.redistribute();
    }

    fn granted_rate(&self, server_id: u64) -> f64 {
        self.contexts.get(&server_id).map(|c| c.granted).unwrap_or(0.)
    }

    fn advance(&mut self, now: f64) {
        let dt = now - self.last_advance;
        self.last_advance = now;
        if dt <= 0. {
            return;
        }
        for context in self.contexts.values() {
            let delivered = context.granted + context.interference_loss;
            self.stats.requested += context.demand * dt;
            self.stats.granted += context.granted * dt;
            self.stats.overcommitted += (context.demand - delivered).max(0.) * dt;
            self.stats.interfered += context.interference_loss * dt;
        }
    }

    fn flush_stats(&mut self) -> FlowStats {
        std::mem::take(&mut self.stats)
    }

    fn context_count(&self) -> usize {
        self.contexts.len()
    }
}

/// Space-shared hypervisor: every guest gets dedicated cores and anything
/// that cannot be fully isolated is rejected instead of time-shared.
pub struct SpaceSharedHypervisor {
    core_count: u32,
    core_speed: f64,
    allocated_cores: u32,
    contexts: FxHashMap<u64, FlowContext>,
    stats: FlowStats,
    last_advance: f64,
}

impl SpaceSharedHypervisor {
    pub fn new(core_count: u32, core_speed: f64) -> Self {
        SpaceSharedHypervisor {
            core_count,
            core_speed,
            allocated_cores: 0,
            contexts: FxHashMap::default(),
            stats: FlowStats::default(),
            last_advance: 0.,
        }
    }
}

impl Hypervisor for SpaceSharedHypervisor {
    fn can_fit(&self, core_count: u32) -> bool {
        core_count <= self.core_count - self.allocated_cores
    }

    fn create_context(&mut self, server_id: u64, core_count: u32) {
        assert!(
            self.can_fit(core_count),
            "guest {} needs {} dedicated cores, host has {} free",
            server_id,
            core_count,
            self.core_count - self.allocated_cores
        );
        let prev = self.contexts.insert(
            server_id,
            FlowContext {
                core_count,
                demand: 0.,
                granted: 0.,
                interference_loss: 0.,
            },
        );
        assert!(prev.is_none(), "guest {} already has a context", server_id);
        self.allocated_cores += core_count;
    }

    fn set_demand(&mut self, server_id: u64, demand: f64) {
        let context = self
            .contexts
            .get_mut(&server_id)
            .unwrap_or_else(|| panic!("guest {} has no context", server_id));
        // Dedicated cores, so demand is granted in full up to the allotment.
        context.demand = demand.min(context.core_count as f64 * self.core_speed);
        context.granted = context.demand;
    }

    fn remove_context(&mut self, server_id: u64) {
        if let Some(context) = self.contexts.remove(&server_id) {
            self.allocated_cores -= context.core_count;
        }
    }

    fn granted_rate(&self, server_id: u64) -> f64 {
        self.contexts.get(&server_id).map(|c| c.granted).unwrap_or(0.)
    }

    fn advance(&mut self, now: f64) {
        let dt = now - self.last_advance;
        self.last_advance = now;
        if dt <= 0. {
            return;
        }
        for context in self.contexts.values() {
            self.stats.requested += context.demand * dt;
            self.stats.granted += context.granted * dt;
        }
    }

    fn flush_stats(&mut self) -> FlowStats {
        std::mem::take(&mut self.stats)
    }

    fn context_count(&self) -> usize {
        self.contexts.len()
    }
}
