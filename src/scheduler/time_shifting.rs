use std::cell::RefCell;
use std::rc::Rc;

use dslab_core::Id;

use crate::entities::Server;
use crate::host::{HostModel, HostView};

use super::{FilterScheduler, Scheduler, SchedulingRequest, SchedulingResult};

/// Filter scheduler that may postpone deferrable servers.
///
/// A server carrying a duration hint and a deadline is held back while the
/// cluster is loaded above `utilization_threshold`, within a bounded
/// look-ahead `window` from submission and never past the latest start time
/// that still meets the deadline. Servers without deadline metadata are
/// placed immediately.
pub struct TimeShiftingScheduler {
    inner: FilterScheduler,
    window: f64,
    utilization_threshold: f64,
}

impl TimeShiftingScheduler {
    pub fn new(inner: FilterScheduler, window: f64, utilization_threshold: f64) -> Self {
        TimeShiftingScheduler {
            inner,
            window,
            utilization_threshold,
        }
    }

    /// Provisioned-to-physical core ratio over the hosts in the up state.
    fn utilization(&self) -> f64 {
        let mut provisioned = 0u64;
        let mut total = 0u64;
        for view in self.inner.hosts() {
            let view = view.borrow();
            if !view.available {
                continue;
            }
            provisioned += view.provisioned_cores as u64;
            total += view.model.core_count as u64;
        }
        if total == 0 {
            0.
        } else {
            provisioned as f64 / total as f64
        }
    }
}

impl Scheduler for TimeShiftingScheduler {
    fn add_host(&mut self, view: Rc<RefCell<HostView>>) {
        self.inner.add_host(view);
    }

    fn remove_host(&mut self, host_id: Id) {
        self.inner.remove_host(host_id);
    }

    fn fits_idle_host(&self, model: &HostModel, server: &Server) -> bool {
        self.inner.fits_idle_host(model, server)
    }

    fn select(&mut self, request: &SchedulingRequest, server: &Server, now: f64) -> SchedulingResult {
        if let (Some(deadline), Some(duration)) = (server.deadline, server.duration_hint) {
            let latest_start = deadline - duration;
            let within_window = now - request.submitted_at < self.window;
            if now < latest_start && within_window && self.utilization() > self.utilization_threshold
            {
                return SchedulingResult::Empty;
            }
        }
        self.inner.select(request, server, now)
    }
}
