//! The only surface a rendering/UI collaborator may call on a live run.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use flocksim_core::{
    ConfigPatch, FlockConfig, Frame, SimError, Simulation, StepSummary, TelemetrySink,
};

use crate::SharedSim;

/// Snapshot of live-run state returned to external clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimSnapshot {
    pub step: u64,
    pub running: bool,
    pub agent_count: usize,
    pub config: FlockConfig,
}

impl From<&Simulation> for SimSnapshot {
    fn from(sim: &Simulation) -> Self {
        Self {
            step: sim.step_count(),
            running: sim.is_running(),
            agent_count: sim.agent_count(),
            config: sim.config().clone(),
        }
    }
}

/// Errors produced by the control surface.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The shared simulation mutex was poisoned.
    #[error("failed to lock simulation state")]
    Lock,
    /// Configuration rejected by validation.
    #[error(transparent)]
    Config(#[from] SimError),
}

impl From<PoisonError<MutexGuard<'_, Simulation>>> for ControlError {
    fn from(_: PoisonError<MutexGuard<'_, Simulation>>) -> Self {
        ControlError::Lock
    }
}

/// Shared handle used by host adapters to drive a live run.
#[derive(Clone)]
pub struct ControlHandle {
    shared: SharedSim,
}

impl ControlHandle {
    /// Construct a live simulation and wrap it in a shareable handle.
    pub fn init(config: FlockConfig, sink: Box<dyn TelemetrySink>) -> Result<Self, ControlError> {
        let sim = Simulation::with_telemetry(config, sink)?;
        Ok(Self {
            shared: Arc::new(Mutex::new(sim)),
        })
    }

    /// Wrap an existing shared simulation.
    #[must_use]
    pub fn new(shared: SharedSim) -> Self {
        Self { shared }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Simulation>, ControlError> {
        self.shared.lock().map_err(|err| err.into())
    }

    /// Retrieve the current run state.
    pub fn snapshot(&self) -> Result<SimSnapshot, ControlError> {
        let sim = self.lock()?;
        Ok(SimSnapshot::from(&*sim))
    }

    /// The most recent step summary, if any step has run.
    pub fn latest_summary(&self) -> Result<Option<StepSummary>, ControlError> {
        let sim = self.lock()?;
        Ok(sim.latest_summary().cloned())
    }

    /// Snapshot of every agent's kinematic state.
    pub fn frame(&self) -> Result<Frame, ControlError> {
        let sim = self.lock()?;
        Ok(sim.frame())
    }

    /// Merge a validated parameter overlay over the current configuration.
    pub fn set_params(&self, patch: &ConfigPatch) -> Result<SimSnapshot, ControlError> {
        let mut sim = self.lock()?;
        if let Err(err) = sim.apply_patch(patch) {
            warn!(%err, "rejected parameter update");
            return Err(err.into());
        }
        debug!(step = sim.step_count(), "applied parameter update");
        Ok(SimSnapshot::from(&*sim))
    }

    /// Allow live ticks to advance the run.
    pub fn start(&self) -> Result<(), ControlError> {
        let mut sim = self.lock()?;
        sim.start();
        debug!(step = sim.step_count(), "run started");
        Ok(())
    }

    /// Stop the run between ticks.
    pub fn stop(&self) -> Result<(), ControlError> {
        let mut sim = self.lock()?;
        sim.stop();
        debug!(step = sim.step_count(), "run stopped");
        Ok(())
    }

    /// Re-randomize the population under the current configuration.
    pub fn reload(&self) -> Result<(), ControlError> {
        let mut sim = self.lock()?;
        sim.reload();
        debug!(agents = sim.agent_count(), "run reloaded");
        Ok(())
    }

    /// Move the world bounds; agents are never relocated.
    pub fn resize(&self, width: f32, height: f32) -> Result<(), ControlError> {
        let mut sim = self.lock()?;
        if let Err(err) = sim.resize(width, height) {
            warn!(%err, width, height, "rejected resize");
            return Err(err.into());
        }
        debug!(width, height, "world resized");
        Ok(())
    }

    /// Advance one live step; the external pacing signal calls this.
    pub fn tick(&self) -> Result<Option<StepSummary>, ControlError> {
        let mut sim = self.lock()?;
        Ok(sim.tick())
    }
}
