//! Shared plumbing for hosts driving a live flocksim run.

use std::sync::{Arc, Mutex};

use flocksim_core::Simulation;

pub type SharedSim = Arc<Mutex<Simulation>>;

pub mod control;

pub use control::{ControlError, ControlHandle, SimSnapshot};
