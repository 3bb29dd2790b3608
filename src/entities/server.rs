use std::collections::HashMap;
use std::rc::Rc;

use dslab_core::Id;
use serde::Serialize;

use super::{Flavor, Image};

/// Label key listing server ids (comma-separated) that must run on the same
/// host as this server.
pub const SAME_HOST_HINT: &str = "scheduler:same-host";
/// Label key listing server ids that must not share a host with this server.
pub const DIFFERENT_HOST_HINT: &str = "scheduler:different-host";

/// Lifecycle state of a server.
///
/// `Terminated` is the initial state; `Deleted` is terminal. A host is bound
/// to the server if and only if the state is `Running` or `Error`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum ServerState {
    Terminated,
    Provisioning,
    Running,
    Error,
    Deleted,
}

/// Observer of server state transitions, invoked synchronously on every
/// transition. Callbacks must not re-enter the compute service.
pub trait ServerWatcher {
    fn on_server_state_changed(&self, server_id: u64, state: ServerState);
}

/// A virtual server: resource shape, boot image and the workload it runs.
///
/// `work` is the total amount of CPU work the server performs before
/// terminating on its own; `None` means it runs until stopped. `deadline` and
/// `duration_hint` are consulted only by time-shifting scheduling policies.
pub struct Server {
    pub id: u64,
    pub name: String,
    pub flavor: Rc<Flavor>,
    pub image: Rc<Image>,
    pub labels: HashMap<String, String>,
    pub meta: HashMap<String, String>,
    pub work: Option<f64>,
    pub deadline: Option<f64>,
    pub duration_hint: Option<f64>,
    pub launched_at: Option<f64>,

    state: ServerState,
    host: Option<Id>,
    watchers: Vec<(u64, Rc<dyn ServerWatcher>)>,
    next_watcher_token: u64,
}

impl Server {
    pub fn new(id: u64, name: String, flavor: Rc<Flavor>, image: Rc<Image>) -> Self {
        Server {
            id,
            name,
            flavor,
            image,
            labels: HashMap::new(),
            meta: HashMap::new(),
            work: None,
            deadline: None,
            duration_hint: None,
            launched_at: None,
            state: ServerState::Terminated,
            host: None,
            watchers: Vec::new(),
            next_watcher_token: 0,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn host(&self) -> Option<Id> {
        self.host
    }

    /// Transitions the server and synchronously notifies all watchers.
    pub(crate) fn set_state(&mut self, state: ServerState) {
        if self.state == state {
            return;
        }
        self.state = state;
        for (_, watcher) in &self.watchers {
            watcher.on_server_state_changed(self.id, state);
        }
    }

    pub(crate) fn bind_host(&mut self, host: Id) {
        self.host = Some(host);
    }

    pub(crate) fn clear_host(&mut self) {
        self.host = None;
    }

    /// Registers a watcher; returns a token for deregistration.
    pub fn watch(&mut self, watcher: Rc<dyn ServerWatcher>) -> u64 {
        let token = self.next_watcher_token;
        self.next_watcher_token += 1;
        self.watchers.push((token, watcher));
        token
    }

    pub fn unwatch(&mut self, token: u64) {
        self.watchers.retain(|(t, _)| *t != token);
    }

    /// Server ids listed under a scheduler-hint label.
    pub fn scheduler_hints(&self, key: &str) -> Vec<u64> {
        self.labels
            .get(key)
            .map(|v| v.split(',').filter_map(|s| s.trim().parse().ok()).collect())
            .unwrap_or_default()
    }
}
