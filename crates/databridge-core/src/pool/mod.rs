//! Elastic worker pools and the controller resizing them

mod controller;
mod workers;

pub use controller::{PoolStep, QueuesController};
pub use workers::{WorkerFactory, WorkerPool, WorkerSlot};
