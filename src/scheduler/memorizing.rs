use std::cell::RefCell;
use std::rc::Rc;

use dslab_core::Id;
use log::warn;

use crate::entities::Server;
use crate::host::{HostModel, HostView};

use super::{FilterScheduler, Scheduler, SchedulingRequest, SchedulingResult};

/// Filter scheduler that remembers how often a request was skipped.
///
/// A skipped request stays in the queue and is retried on every cycle; it is
/// never failed purely because of its skip count. Past `max_times_skipped`
/// the scheduler only flags the request as starving.
pub struct MemorizingScheduler {
    inner: FilterScheduler,
    max_times_skipped: u32,
}

impl MemorizingScheduler {
    pub fn new(inner: FilterScheduler, max_times_skipped: u32) -> Self {
        MemorizingScheduler {
            inner,
            max_times_skipped,
        }
    }
}

impl Scheduler for MemorizingScheduler {
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
        let result = self.inner.select(request, server, now);
        if let SchedulingResult::Empty = result {
            request.record_skip();
            if request.times_skipped() == self.max_times_skipped + 1 {
                warn!(
                    "server {} was skipped {} times, keeping it queued",
                    server.id,
                    request.times_skipped()
                );
            }
        }
        result
    }
}
