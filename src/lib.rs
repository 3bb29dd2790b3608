#![doc = include_str!("../readme.md")]

pub mod client;
pub mod config;
pub mod entities;
pub mod host;
pub mod monitoring;
pub mod scheduler;
pub mod service;
pub mod simulation;

pub use client::{ComputeClient, FlavorInfo, ImageInfo, ServerInfo};
pub use entities::{Flavor, Image, Server, ServerState, ServerWatcher};
pub use host::{FairShareHypervisor, HostModel, HostView, SimHost, SpaceSharedHypervisor};
pub use monitoring::Monitoring;
pub use scheduler::{FilterScheduler, Scheduler, SchedulingRequest, SchedulingResult};
pub use service::{ComputeError, ComputeService, SchedulerStats, ServerRequest};
pub use simulation::ComputeSimulation;
