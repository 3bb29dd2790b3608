//! Client sessions over the compute service.
//!
//! Queries return read-only projections built on demand from the
//! authoritative entities, never live aliases, so a client cannot mutate
//! scheduling state directly. Provisioning calls only enqueue intent: the
//! outcome becomes visible after a scheduling cycle, through queries or
//! registered watchers.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use dslab_core::Id;
use serde::Serialize;

use crate::entities::{ServerState, ServerWatcher};
use crate::service::{ComputeError, ComputeService, ServerRequest};

#[derive(Clone, Serialize)]
pub struct FlavorInfo {
    pub id: u64,
    pub name: String,
    pub core_count: u32,
    pub memory_size: u64,
    pub labels: HashMap<String, String>,
    pub meta: HashMap<String, String>,
}

#[derive(Clone, Serialize)]
pub struct ImageInfo {
    pub id: u64,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub meta: HashMap<String, String>,
}

#[derive(Clone, Serialize)]
pub struct ServerInfo {
    pub id: u64,
    pub name: String,
    pub flavor_id: u64,
    pub image_id: u64,
    pub state: ServerState,
    pub host: Option<Id>,
    pub launched_at: Option<f64>,
    pub labels: HashMap<String, String>,
    pub meta: HashMap<String, String>,
}

/// One logical client session. Operations fail once either the session or
/// the underlying service has been closed.
pub struct ComputeClient {
    service: Rc<RefCell<ComputeService>>,
    closed: Cell<bool>,
}

impl ComputeClient {
    pub fn new(service: Rc<RefCell<ComputeService>>) -> Self {
        ComputeClient {
            service,
            closed: Cell::new(false),
        }
    }

    pub fn close(&self) {
        self.closed.set(true);
    }

    fn ensure_open(&self) -> Result<(), ComputeError> {
        if self.closed.get() {
            Err(ComputeError::ClientClosed)
        } else {
            Ok(())
        }
    }

    pub fn create_flavor(
        &self,
        name: &str,
        core_count: u32,
        memory_size: u64,
    ) -> Result<u64, ComputeError> {
        self.ensure_open()?;
        self.service
            .borrow_mut()
            .create_flavor(name, core_count, memory_size)
    }

    pub fn flavor(&self, id: u64) -> Result<Option<FlavorInfo>, ComputeError> {
        self.ensure_open()?;
        Ok(self.service.borrow().flavor(id).map(|f| FlavorInfo {
            id: f.id,
            name: f.name.clone(),
            core_count: f.core_count,
            memory_size: f.memory_size,
            labels: f.labels.clone(),
            meta: f.meta.clone(),
        }))
    }

    pub fn delete_flavor(&self, id: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        self.service.borrow_mut().delete_flavor(id)
    }

    pub fn create_image(&self, name: &str) -> Result<u64, ComputeError> {
        self.ensure_open()?;
        self.service.borrow_mut().create_image(name)
    }

    pub fn image(&self, id: u64) -> Result<Option<ImageInfo>, ComputeError> {
        self.ensure_open()?;
        Ok(self.service.borrow().image(id).map(|i| ImageInfo {
            id: i.id,
            name: i.name.clone(),
            labels: i.labels.clone(),
            meta: i.meta.clone(),
        }))
    }

    pub fn reload_image(&self, id: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        self.service.borrow_mut().reload_image(id)
    }

    pub fn delete_image(&self, id: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        self.service.borrow_mut().delete_image(id)
    }

    pub fn create_server(&self, request: ServerRequest) -> Result<u64, ComputeError> {
        self.ensure_open()?;
        self.service.borrow_mut().create_server(request)
    }

    pub fn start_server(&self, id: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        self.service.borrow_mut().start_server(id)
    }

    pub fn stop_server(&self, id: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        self.service.borrow_mut().stop_server(id)
    }

    pub fn delete_server(&self, id: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        self.service.borrow_mut().delete_server(id)
    }

    pub fn server(&self, id: u64) -> Result<Option<ServerInfo>, ComputeError> {
        self.ensure_open()?;
        Ok(self.service.borrow().server(id).map(|s| {
            let s = s.borrow();
            ServerInfo {
                id: s.id,
                name: s.name.clone(),
                flavor_id: s.flavor.id,
                image_id: s.image.id,
                state: s.state(),
                host: s.host(),
                launched_at: s.launched_at,
                labels: s.labels.clone(),
                meta: s.meta.clone(),
            }
        }))
    }

    pub fn find_server(&self, name: &str) -> Result<Option<ServerInfo>, ComputeError> {
        self.ensure_open()?;
        let id = self.service.borrow().find_server(name);
        match id {
            Some(id) => self.server(id),
            None => Ok(None),
        }
    }

    pub fn watch_server(
        &self,
        id: u64,
        watcher: Rc<dyn ServerWatcher>,
    ) -> Result<u64, ComputeError> {
        self.ensure_open()?;
        self.service.borrow_mut().watch_server(id, watcher)
    }

    pub fn unwatch_server(&self, id: u64, token: u64) -> Result<(), ComputeError> {
        self.ensure_open()?;
        self.service.borrow_mut().unwatch_server(id, token)
    }
}
