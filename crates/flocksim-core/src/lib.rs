//! Core engine for the flocksim workspace: particle store, interaction
//! rules, integrator, order parameters, and the compact telemetry encoding
//! streamed to external observers.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;
use thiserror::Error;

/// Maximum number of recent positions retained per agent trail.
pub const TRAIL_CAPACITY: usize = 50;

/// Half-width of the symmetric range used for initial velocity draws.
const INITIAL_SPEED_SPREAD: f32 = 5.0;

/// Largest value representable in the quantized position encoding.
const QUANT_MAX: f32 = 65_535.0;

/// Errors emitted by the simulation engine.
#[derive(Debug, Error)]
pub enum SimError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Axis-aligned 2D position (SoA column representation).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Per-step velocity in world units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub dx: f32,
    pub dy: f32,
}

impl Velocity {
    /// Construct a new velocity vector.
    #[must_use]
    pub const fn new(dx: f32, dy: f32) -> Self {
        Self { dx, dy }
    }

    /// Euclidean magnitude.
    #[must_use]
    pub fn speed(&self) -> f32 {
        (self.dx * self.dx + self.dy * self.dy).sqrt()
    }
}

/// Static configuration for one simulation run.
///
/// All fields are fixed for the duration of a run; installing a new
/// configuration (via [`FlockConfig::apply_patch`]) affects subsequent steps,
/// while population size and seeding only take hold on the next reload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlockConfig {
    /// Pull toward the local center of mass, per step.
    pub cohesion_factor: f32,
    /// Blend toward the local average heading, per step.
    pub alignment_factor: f32,
    /// Scale applied to the accumulated short-range repulsion vector.
    pub separation_factor: f32,
    /// Radius within which agents are treated as neighbors.
    pub visual_range: f32,
    /// Distance below which agents repel each other.
    pub min_distance: f32,
    /// Hard cap on post-step speed.
    pub speed_limit: f32,
    /// Width of the soft containment band along each world edge.
    pub margin: f32,
    /// Velocity nudge applied per step inside the containment band.
    pub turn_factor: f32,
    /// Number of agents spawned at run start.
    pub num_boids: u32,
    /// World width in world units.
    pub width: f32,
    /// World height in world units.
    pub height: f32,
    /// Step count for a bounded batch run; `None` runs live under external pacing.
    pub steps: Option<u32>,
    /// Telemetry emission rate in Hz; 0 disables periodic emission.
    pub telemetry_hz: f32,
    /// Record a bounded trail of recent positions per agent.
    pub record_trails: bool,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent step summaries retained in memory; 0 disables.
    pub history_capacity: usize,
}

impl Default for FlockConfig {
    fn default() -> Self {
        Self {
            cohesion_factor: 0.005,
            alignment_factor: 0.05,
            separation_factor: 0.05,
            visual_range: 75.0,
            min_distance: 20.0,
            speed_limit: 15.0,
            margin: 200.0,
            turn_factor: 1.0,
            num_boids: 100,
            width: 1_000.0,
            height: 1_000.0,
            steps: None,
            telemetry_hz: 0.0,
            record_trails: false,
            rng_seed: None,
            history_capacity: 256,
        }
    }
}

impl FlockConfig {
    /// Validates every field, naming the offending one on rejection.
    pub fn validate(&self) -> Result<(), SimError> {
        if !self.width.is_finite() || self.width <= 0.0 {
            return Err(SimError::InvalidConfig("width must be positive and finite"));
        }
        if !self.height.is_finite() || self.height <= 0.0 {
            return Err(SimError::InvalidConfig(
                "height must be positive and finite",
            ));
        }
        if !self.cohesion_factor.is_finite() {
            return Err(SimError::InvalidConfig("cohesion_factor must be finite"));
        }
        if !self.alignment_factor.is_finite() {
            return Err(SimError::InvalidConfig("alignment_factor must be finite"));
        }
        if !self.separation_factor.is_finite() {
            return Err(SimError::InvalidConfig("separation_factor must be finite"));
        }
        if !self.visual_range.is_finite() || self.visual_range < 0.0 {
            return Err(SimError::InvalidConfig(
                "visual_range must be non-negative and finite",
            ));
        }
        if !self.min_distance.is_finite() || self.min_distance < 0.0 {
            return Err(SimError::InvalidConfig(
                "min_distance must be non-negative and finite",
            ));
        }
        if !self.speed_limit.is_finite() || self.speed_limit < 0.0 {
            return Err(SimError::InvalidConfig(
                "speed_limit must be non-negative and finite",
            ));
        }
        if !self.margin.is_finite() || self.margin < 0.0 {
            return Err(SimError::InvalidConfig(
                "margin must be non-negative and finite",
            ));
        }
        if !self.turn_factor.is_finite() {
            return Err(SimError::InvalidConfig("turn_factor must be finite"));
        }
        if !self.telemetry_hz.is_finite() || self.telemetry_hz < 0.0 {
            return Err(SimError::InvalidConfig(
                "telemetry_hz must be non-negative and finite",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }

    /// Overlay `patch` onto this configuration and re-validate the result.
    ///
    /// The receiver is untouched on rejection.
    pub fn apply_patch(&self, patch: &ConfigPatch) -> Result<Self, SimError> {
        let mut merged = self.clone();
        if let Some(v) = patch.cohesion_factor {
            merged.cohesion_factor = v;
        }
        if let Some(v) = patch.alignment_factor {
            merged.alignment_factor = v;
        }
        if let Some(v) = patch.separation_factor {
            merged.separation_factor = v;
        }
        if let Some(v) = patch.visual_range {
            merged.visual_range = v;
        }
        if let Some(v) = patch.min_distance {
            merged.min_distance = v;
        }
        if let Some(v) = patch.speed_limit {
            merged.speed_limit = v;
        }
        if let Some(v) = patch.margin {
            merged.margin = v;
        }
        if let Some(v) = patch.turn_factor {
            merged.turn_factor = v;
        }
        if let Some(v) = patch.num_boids {
            merged.num_boids = v;
        }
        if let Some(v) = patch.width {
            merged.width = v;
        }
        if let Some(v) = patch.height {
            merged.height = v;
        }
        if let Some(v) = patch.steps {
            merged.steps = Some(v);
        }
        if let Some(v) = patch.telemetry_hz {
            merged.telemetry_hz = v;
        }
        if let Some(v) = patch.record_trails {
            merged.record_trails = v;
        }
        if let Some(v) = patch.rng_seed {
            merged.rng_seed = Some(v);
        }
        if let Some(v) = patch.history_capacity {
            merged.history_capacity = v;
        }
        merged.validate()?;
        Ok(merged)
    }

    /// Rescale the three interaction factors so that 1.0 means "reference
    /// default" (the unit convention used by notebook-style callers).
    #[must_use]
    pub fn with_scaled_factors(mut self, attractive: f32, alignment: f32, avoid: f32) -> Self {
        let reference = Self::default();
        self.cohesion_factor = attractive * reference.cohesion_factor;
        self.alignment_factor = alignment * reference.alignment_factor;
        self.separation_factor = avoid * reference.separation_factor;
        self
    }
}

/// Partial configuration overlay; unset fields keep their current values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConfigPatch {
    pub cohesion_factor: Option<f32>,
    pub alignment_factor: Option<f32>,
    pub separation_factor: Option<f32>,
    pub visual_range: Option<f32>,
    pub min_distance: Option<f32>,
    pub speed_limit: Option<f32>,
    pub margin: Option<f32>,
    pub turn_factor: Option<f32>,
    pub num_boids: Option<u32>,
    pub width: Option<f32>,
    pub height: Option<f32>,
    pub steps: Option<u32>,
    pub telemetry_hz: Option<f32>,
    pub record_trails: Option<bool>,
    pub rng_seed: Option<u64>,
    pub history_capacity: Option<usize>,
}

/// Collection of per-agent columns for hot-path iteration.
///
/// Agents carry no identity; the column index is the only handle, and the
/// population is fixed between spawns.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ParticleColumns {
    positions: Vec<Position>,
    velocities: Vec<Velocity>,
    trails: Vec<VecDeque<Position>>,
}

impl ParticleColumns {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            velocities: Vec::with_capacity(capacity),
            trails: Vec::with_capacity(capacity),
        }
    }

    /// Number of active rows in the columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if there are no active rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all rows while retaining capacity.
    pub fn clear(&mut self) {
        self.positions.clear();
        self.velocities.clear();
        self.trails.clear();
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, position: Position, velocity: Velocity) {
        self.positions.push(position);
        self.velocities.push(velocity);
        self.trails.push(VecDeque::new());
        self.debug_assert_coherent();
    }

    /// Immutable access to the positions slice.
    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Mutable access to the positions slice.
    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Position] {
        &mut self.positions
    }

    /// Immutable access to the velocities slice.
    #[must_use]
    pub fn velocities(&self) -> &[Velocity] {
        &self.velocities
    }

    /// Mutable access to the velocities slice.
    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut [Velocity] {
        &mut self.velocities
    }

    /// Immutable access to the per-agent trails.
    #[must_use]
    pub fn trails(&self) -> &[VecDeque<Position>] {
        &self.trails
    }

    /// Advance every position by its velocity (explicit Euler, unit step).
    pub fn integrate(&mut self) {
        for (position, velocity) in self.positions.iter_mut().zip(&self.velocities) {
            position.x += velocity.dx;
            position.y += velocity.dy;
        }
    }

    /// Append the current positions to the trails, evicting the oldest entry
    /// once a trail is at capacity.
    pub fn record_trails(&mut self) {
        for (trail, position) in self.trails.iter_mut().zip(&self.positions) {
            if trail.len() == TRAIL_CAPACITY {
                trail.pop_front();
            }
            trail.push_back(*position);
        }
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.trails.len());
    }
}

/// One agent's kinematic state inside a frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ParticleRecord {
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
}

/// Ordered snapshot of every agent at one step boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub particles: Vec<ParticleRecord>,
}

/// Result of one bounded batch run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchRun {
    pub step_count: u32,
    pub frames: Vec<Frame>,
}

/// Scalar and vector summaries of collective motion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct OrderParameters {
    /// Per-axis mean of agent velocities.
    pub mean_velocity: Velocity,
    /// Magnitude of the unnormalized velocity sum.
    pub velocity: f32,
    /// Magnitude of the mean unit heading; 1 = aligned, 0 = cancelling.
    pub polarization: f32,
    /// Magnitude of the accumulated rotation term around the center of mass.
    pub rotation_order: f32,
}

impl OrderParameters {
    /// Measure the current snapshot; `None` when the store is empty.
    ///
    /// Agents with zero speed contribute nothing to polarization and
    /// rotation order, and agents sitting exactly on the center of mass
    /// contribute nothing to rotation order.
    #[must_use]
    pub fn measure(positions: &[Position], velocities: &[Velocity]) -> Option<Self> {
        let n = positions.len();
        if n == 0 {
            return None;
        }
        let inv_n = 1.0 / n as f32;

        let mut sum_dx = 0.0f32;
        let mut sum_dy = 0.0f32;
        for velocity in velocities {
            sum_dx += velocity.dx;
            sum_dy += velocity.dy;
        }
        let mean_velocity = Velocity::new(sum_dx * inv_n, sum_dy * inv_n);
        let velocity = (sum_dx * sum_dx + sum_dy * sum_dy).sqrt();

        let mut unit_dx = 0.0f32;
        let mut unit_dy = 0.0f32;
        for velocity in velocities {
            let speed = velocity.speed();
            if speed > 0.0 {
                unit_dx += velocity.dx / speed;
                unit_dy += velocity.dy / speed;
            }
        }
        let polarization = (unit_dx * unit_dx + unit_dy * unit_dy).sqrt() * inv_n;

        let mut center_x = 0.0f32;
        let mut center_y = 0.0f32;
        for position in positions {
            center_x += position.x;
            center_y += position.y;
        }
        center_x *= inv_n;
        center_y *= inv_n;

        let mut rotation_sum = 0.0f32;
        for (position, velocity) in positions.iter().zip(velocities) {
            let speed = velocity.speed();
            if speed <= 0.0 {
                continue;
            }
            let radial_x = position.x - center_x;
            let radial_y = position.y - center_y;
            let distance = (radial_x * radial_x + radial_y * radial_y).sqrt();
            if distance <= 0.0 {
                continue;
            }
            let unit_x = velocity.dx / speed;
            let unit_y = velocity.dy / speed;
            let radial_x = radial_x / distance;
            let radial_y = radial_y / distance;
            // Asymmetric on purpose: u.x*r.x - r.y*u.y, not the 2D cross product.
            rotation_sum += unit_x * radial_x - radial_y * unit_y;
        }
        let rotation_order = (rotation_sum * inv_n).abs();

        Some(Self {
            mean_velocity,
            velocity,
            polarization,
            rotation_order,
        })
    }
}

/// Per-step observability record retained in the bounded history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSummary {
    pub step: u64,
    pub agent_count: usize,
    pub order: Option<OrderParameters>,
}

/// Visit every *other* agent strictly within `radius` of `positions[idx]`.
///
/// The visitor receives the neighbor index and the squared distance. The scan
/// is a deliberate brute-force all-pairs pass; no ordering is guaranteed.
pub fn visit_neighbors(
    positions: &[Position],
    idx: usize,
    radius: f32,
    visitor: &mut impl FnMut(usize, f32),
) {
    let origin = positions[idx];
    let radius_sq = radius * radius;
    for (other, position) in positions.iter().enumerate() {
        if other == idx {
            continue;
        }
        let dx = origin.x - position.x;
        let dy = origin.y - position.y;
        let dist_sq = dx * dx + dy * dy;
        if dist_sq < radius_sq {
            visitor(other, dist_sq);
        }
    }
}

/// Rescale `velocity` to `limit` when its magnitude exceeds it.
fn cap_speed(velocity: &mut Velocity, limit: f32) {
    let speed = velocity.speed();
    if speed > limit && speed > 0.0 {
        let scale = limit / speed;
        velocity.dx *= scale;
        velocity.dy *= scale;
    }
}

/// Compute one agent's post-rule velocity from the stable pre-step snapshot.
///
/// Rules run in a fixed order: cohesion, separation, alignment, speed cap,
/// boundary containment. Cohesion and alignment averages include the agent
/// itself once; the cap is re-applied after containment so the nudge never
/// leaks an over-limit speed into the integrated state.
fn steer_agent(
    config: &FlockConfig,
    positions: &[Position],
    velocities: &[Velocity],
    idx: usize,
) -> Velocity {
    let position = positions[idx];
    let mut velocity = velocities[idx];

    // Cohesion: steer toward the local center of mass.
    let mut center_x = position.x;
    let mut center_y = position.y;
    let mut count = 1u32;
    visit_neighbors(positions, idx, config.visual_range, &mut |other, _| {
        center_x += positions[other].x;
        center_y += positions[other].y;
        count += 1;
    });
    let inv = 1.0 / count as f32;
    velocity.dx += (center_x * inv - position.x) * config.cohesion_factor;
    velocity.dy += (center_y * inv - position.y) * config.cohesion_factor;

    // Separation: accumulate raw repulsion offsets from agents that are too close.
    let mut move_x = 0.0f32;
    let mut move_y = 0.0f32;
    visit_neighbors(positions, idx, config.min_distance, &mut |other, _| {
        move_x += position.x - positions[other].x;
        move_y += position.y - positions[other].y;
    });
    velocity.dx += move_x * config.separation_factor;
    velocity.dy += move_y * config.separation_factor;

    // Alignment: steer toward the local average velocity. The average reads
    // the in-step working velocity for self and snapshot values for others.
    let mut avg_dx = velocity.dx;
    let mut avg_dy = velocity.dy;
    let mut count = 1u32;
    visit_neighbors(positions, idx, config.visual_range, &mut |other, _| {
        avg_dx += velocities[other].dx;
        avg_dy += velocities[other].dy;
        count += 1;
    });
    let inv = 1.0 / count as f32;
    velocity.dx += (avg_dx * inv - velocity.dx) * config.alignment_factor;
    velocity.dy += (avg_dy * inv - velocity.dy) * config.alignment_factor;

    cap_speed(&mut velocity, config.speed_limit);

    // Soft containment: per-axis nudge inside the margin band, never a clamp.
    if position.x < config.margin {
        velocity.dx += config.turn_factor;
    }
    if position.x > config.width - config.margin {
        velocity.dx -= config.turn_factor;
    }
    if position.y < config.margin {
        velocity.dy += config.turn_factor;
    }
    if position.y > config.height - config.margin {
        velocity.dy -= config.turn_factor;
    }
    cap_speed(&mut velocity, config.speed_limit);

    velocity
}

/// Identifies how a telemetry payload's position blob is encoded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryFormat {
    /// Metadata only; no position blob.
    Meta,
    /// Interleaved little-endian u16 (x, y) pairs, base64-encoded.
    U16xy,
}

/// Interaction-parameter subset echoed inside telemetry payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryParams {
    pub cohesion_factor: f32,
    pub alignment_factor: f32,
    pub separation_factor: f32,
    pub visual_range: f32,
    pub min_distance: f32,
    pub speed_limit: f32,
    pub margin: f32,
    pub turn_factor: f32,
    pub num_boids: u32,
}

impl From<&FlockConfig> for TelemetryParams {
    fn from(config: &FlockConfig) -> Self {
        Self {
            cohesion_factor: config.cohesion_factor,
            alignment_factor: config.alignment_factor,
            separation_factor: config.separation_factor,
            visual_range: config.visual_range,
            min_distance: config.min_distance,
            speed_limit: config.speed_limit,
            margin: config.margin,
            turn_factor: config.turn_factor,
            num_boids: config.num_boids,
        }
    }
}

/// Point-in-time telemetry envelope (JSON-safe).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryPayload {
    /// Elapsed milliseconds since run start.
    #[serde(rename = "tMs")]
    pub t_ms: u64,
    #[serde(rename = "stepCount")]
    pub step_count: u64,
    /// Agent count.
    pub n: usize,
    /// World width.
    pub w: f32,
    /// World height.
    pub h: f32,
    pub format: TelemetryFormat,
    pub params: TelemetryParams,
    /// Magnitude of the unnormalized velocity sum.
    pub velocity: f32,
    /// Per-axis mean velocity.
    pub vector: Velocity,
    pub polarization: f32,
    #[serde(rename = "rotationOrder")]
    pub rotation_order: f32,
    /// Present only when `format` is `u16xy`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Quantize a coordinate into the 16-bit telemetry range.
///
/// Values outside `[0, extent]` clamp to the nearest boundary quantum; the
/// result never wraps.
#[must_use]
pub fn quantize_coord(value: f32, extent: f32) -> u16 {
    let normalized = (value / extent).clamp(0.0, 1.0);
    (normalized * QUANT_MAX).round() as u16
}

/// Expand a quantized coordinate back into world space.
#[must_use]
pub fn dequantize_coord(raw: u16, extent: f32) -> f32 {
    f32::from(raw) / QUANT_MAX * extent
}

/// Encode positions as interleaved little-endian u16 (x, y) pairs in base64.
#[must_use]
pub fn encode_positions(positions: &[Position], width: f32, height: f32) -> String {
    let mut bytes = Vec::with_capacity(positions.len() * 4);
    for position in positions {
        bytes.extend_from_slice(&quantize_coord(position.x, width).to_le_bytes());
        bytes.extend_from_slice(&quantize_coord(position.y, height).to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Rate-based emission gate fed millisecond timestamps.
///
/// Emission is spaced by wall-clock time (`1000 / hz` ms minimum), never by
/// tick count; a zero rate never emits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryThrottle {
    interval_ms: Option<f64>,
    last_emit_ms: Option<u64>,
}

impl TelemetryThrottle {
    /// Build a throttle for the given emission rate in Hz.
    #[must_use]
    pub fn from_rate(hz: f32) -> Self {
        Self {
            interval_ms: Self::interval(hz),
            last_emit_ms: None,
        }
    }

    fn interval(hz: f32) -> Option<f64> {
        (hz > 0.0).then(|| 1_000.0 / f64::from(hz))
    }

    /// Change the emission rate without disturbing the last-emission mark.
    pub fn set_rate(&mut self, hz: f32) {
        self.interval_ms = Self::interval(hz);
    }

    /// Whether a payload should go out at `now_ms`; records the emission when yes.
    pub fn should_emit(&mut self, now_ms: u64) -> bool {
        let Some(interval) = self.interval_ms else {
            return false;
        };
        if let Some(last) = self.last_emit_ms {
            if (now_ms.saturating_sub(last) as f64) < interval {
                return false;
            }
        }
        self.last_emit_ms = Some(now_ms);
        true
    }

    /// Forget the last emission (used when a run restarts).
    pub fn reset(&mut self) {
        self.last_emit_ms = None;
    }
}

/// Capability handed to the engine for delivering telemetry payloads.
pub trait TelemetrySink: Send {
    fn accept(&mut self, payload: &TelemetryPayload);
}

/// No-op telemetry sink.
#[derive(Debug, Default)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn accept(&mut self, _payload: &TelemetryPayload) {}
}

/// A complete simulation run: particle store, step pipeline, and telemetry.
///
/// Owned exclusively by one runner; steps are strictly sequential, and every
/// force computation reads the previous step's fully-integrated state.
pub struct Simulation {
    config: FlockConfig,
    step: u64,
    running: bool,
    rng: SmallRng,
    columns: ParticleColumns,
    sink: Box<dyn TelemetrySink>,
    throttle: TelemetryThrottle,
    epoch: Instant,
    history: VecDeque<StepSummary>,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("config", &self.config)
            .field("step", &self.step)
            .field("running", &self.running)
            .field("agent_count", &self.columns.len())
            .finish()
    }
}

impl Simulation {
    /// Instantiate a run with a no-op telemetry sink (batch mode).
    pub fn new(config: FlockConfig) -> Result<Self, SimError> {
        Self::with_telemetry(config, Box::new(NullTelemetry))
    }

    /// Instantiate a run wired to a telemetry sink (live mode).
    ///
    /// Emits a one-shot metadata-only payload so a consumer throttled to
    /// 0 Hz still learns the world shape.
    pub fn with_telemetry(
        config: FlockConfig,
        sink: Box<dyn TelemetrySink>,
    ) -> Result<Self, SimError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let throttle = TelemetryThrottle::from_rate(config.telemetry_hz);
        let history_capacity = config.history_capacity;
        let mut sim = Self {
            columns: ParticleColumns::with_capacity(config.num_boids as usize),
            config,
            step: 0,
            running: false,
            rng,
            sink,
            throttle,
            epoch: Instant::now(),
            history: VecDeque::with_capacity(history_capacity),
        };
        sim.spawn_particles();
        let payload = sim.telemetry_payload(false, 0);
        sim.sink.accept(&payload);
        Ok(sim)
    }

    /// Draw a fresh population: independent-uniform positions inside the
    /// world bounds, independent-uniform velocities in a symmetric range.
    fn spawn_particles(&mut self) {
        self.columns.clear();
        for _ in 0..self.config.num_boids {
            let position = Position::new(
                self.rng.random_range(0.0..self.config.width),
                self.rng.random_range(0.0..self.config.height),
            );
            let velocity = Velocity::new(
                self.rng
                    .random_range(-INITIAL_SPEED_SPREAD..INITIAL_SPEED_SPREAD),
                self.rng
                    .random_range(-INITIAL_SPEED_SPREAD..INITIAL_SPEED_SPREAD),
            );
            self.columns.push(position, velocity);
        }
    }

    /// Execute one simulation step and return its summary.
    pub fn step(&mut self) -> StepSummary {
        self.stage_forces();
        self.columns.integrate();
        if self.config.record_trails {
            self.columns.record_trails();
        }
        self.step += 1;
        let summary = StepSummary {
            step: self.step,
            agent_count: self.columns.len(),
            order: OrderParameters::measure(self.columns.positions(), self.columns.velocities()),
        };
        self.push_history(summary.clone());
        summary
    }

    /// Apply the interaction rules to every agent from a stable snapshot.
    fn stage_forces(&mut self) {
        if self.columns.is_empty() {
            return;
        }
        let positions = self.columns.positions().to_vec();
        let velocities = self.columns.velocities().to_vec();
        let config = &self.config;
        let steered: Vec<Velocity> = (0..positions.len())
            .into_par_iter()
            .map(|idx| steer_agent(config, &positions, &velocities, idx))
            .collect();
        self.columns.velocities_mut().copy_from_slice(&steered);
    }

    fn push_history(&mut self, summary: StepSummary) {
        let capacity = self.config.history_capacity;
        if capacity == 0 {
            return;
        }
        if self.history.len() >= capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    /// Advance one live step under external pacing.
    ///
    /// Returns `None` without stepping while the run is stopped. After a
    /// step, telemetry goes out when the wall-clock throttle allows it.
    pub fn tick(&mut self) -> Option<StepSummary> {
        if !self.running {
            return None;
        }
        let summary = self.step();
        let now_ms = self.elapsed_ms();
        if self.throttle.should_emit(now_ms) {
            let payload = self.telemetry_payload(true, now_ms);
            self.sink.accept(&payload);
        }
        Some(summary)
    }

    /// Allow live ticks to advance the run.
    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stop the run between ticks; state is preserved.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Re-randomize the population under the current configuration.
    ///
    /// Resets the step counter, history, throttle, and elapsed-time origin.
    pub fn reload(&mut self) {
        self.spawn_particles();
        self.step = 0;
        self.history.clear();
        self.throttle.reset();
        self.epoch = Instant::now();
    }

    /// Move the world bounds mid-run.
    ///
    /// Agents outside the new bounds are not relocated; only future
    /// containment nudges react to the new extents.
    pub fn resize(&mut self, width: f32, height: f32) -> Result<(), SimError> {
        if !width.is_finite() || width <= 0.0 {
            return Err(SimError::InvalidConfig("width must be positive and finite"));
        }
        if !height.is_finite() || height <= 0.0 {
            return Err(SimError::InvalidConfig(
                "height must be positive and finite",
            ));
        }
        self.config.width = width;
        self.config.height = height;
        Ok(())
    }

    /// Re-validate and install a configuration overlay.
    ///
    /// Interaction parameters take effect on the next step; population size
    /// and seeding only take hold on the next [`Simulation::reload`].
    pub fn apply_patch(&mut self, patch: &ConfigPatch) -> Result<(), SimError> {
        let merged = self.config.apply_patch(patch)?;
        self.throttle.set_rate(merged.telemetry_hz);
        self.config = merged;
        Ok(())
    }

    /// Replace the telemetry sink.
    pub fn set_telemetry(&mut self, sink: Box<dyn TelemetrySink>) {
        self.sink = sink;
    }

    /// Build a telemetry envelope for the current state.
    #[must_use]
    pub fn telemetry_payload(&self, include_positions: bool, t_ms: u64) -> TelemetryPayload {
        let order =
            OrderParameters::measure(self.columns.positions(), self.columns.velocities());
        let (vector, velocity, polarization, rotation_order) = match order {
            Some(order) => (
                order.mean_velocity,
                order.velocity,
                order.polarization,
                order.rotation_order,
            ),
            None => (Velocity::default(), 0.0, 0.0, 0.0),
        };
        let (format, data) = if include_positions {
            (
                TelemetryFormat::U16xy,
                Some(encode_positions(
                    self.columns.positions(),
                    self.config.width,
                    self.config.height,
                )),
            )
        } else {
            (TelemetryFormat::Meta, None)
        };
        TelemetryPayload {
            t_ms,
            step_count: self.step,
            n: self.columns.len(),
            w: self.config.width,
            h: self.config.height,
            format,
            params: TelemetryParams::from(&self.config),
            velocity,
            vector,
            polarization,
            rotation_order,
            data,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Snapshot of every agent's kinematic state in stable agent order.
    #[must_use]
    pub fn frame(&self) -> Frame {
        let particles = self
            .columns
            .positions()
            .iter()
            .zip(self.columns.velocities())
            .map(|(position, velocity)| ParticleRecord {
                x: position.x,
                y: position.y,
                dx: velocity.dx,
                dy: velocity.dy,
            })
            .collect();
        Frame { particles }
    }

    /// Returns an immutable reference to the configuration.
    #[must_use]
    pub fn config(&self) -> &FlockConfig {
        &self.config
    }

    /// Steps executed so far.
    #[must_use]
    pub const fn step_count(&self) -> u64 {
        self.step
    }

    /// Whether live ticks currently advance the run.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.columns.len()
    }

    /// Read-only access to the particle columns.
    #[must_use]
    pub fn columns(&self) -> &ParticleColumns {
        &self.columns
    }

    /// Iterate over retained step summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StepSummary> {
        self.history.iter()
    }

    /// The most recent step summary, if any.
    #[must_use]
    pub fn latest_summary(&self) -> Option<&StepSummary> {
        self.history.back()
    }
}

/// Execute a bounded batch run described by `config`.
///
/// Produces exactly `steps` frames, one captured after each integrated step,
/// with no telemetry throttling.
pub fn run_batch(config: &FlockConfig) -> Result<BatchRun, SimError> {
    let steps = config
        .steps
        .ok_or(SimError::InvalidConfig("steps must be set for a batch run"))?;
    let mut sim = Simulation::new(config.clone())?;
    let mut frames = Vec::with_capacity(steps as usize);
    for _ in 0..steps {
        sim.step();
        frames.push(sim.frame());
    }
    Ok(BatchRun {
        step_count: steps,
        frames,
    })
}

/// Run an ordered batch of configurations; each runs independently and the
/// results come back in submission order.
pub fn run_batch_suite(configs: &[FlockConfig]) -> Result<Vec<BatchRun>, SimError> {
    configs.iter().map(run_batch).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> FlockConfig {
        FlockConfig {
            num_boids: 0,
            rng_seed: Some(7),
            ..FlockConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        FlockConfig::default().validate().expect("default config");
    }

    #[test]
    fn validation_names_the_offending_field() {
        let bad = FlockConfig {
            cohesion_factor: f32::NAN,
            ..FlockConfig::default()
        };
        let err = bad.validate().expect_err("non-finite factor");
        assert!(err.to_string().contains("cohesion_factor"));

        let bad = FlockConfig {
            width: 0.0,
            ..FlockConfig::default()
        };
        let err = bad.validate().expect_err("zero width");
        assert!(err.to_string().contains("width"));

        let bad = FlockConfig {
            telemetry_hz: -1.0,
            ..FlockConfig::default()
        };
        let err = bad.validate().expect_err("negative rate");
        assert!(err.to_string().contains("telemetry_hz"));
    }

    #[test]
    fn patch_merges_and_revalidates() {
        let base = FlockConfig::default();
        let patch = ConfigPatch {
            visual_range: Some(50.0),
            ..ConfigPatch::default()
        };
        let merged = base.apply_patch(&patch).expect("valid patch");
        assert_eq!(merged.visual_range, 50.0);
        assert_eq!(merged.cohesion_factor, base.cohesion_factor);

        let bad = ConfigPatch {
            speed_limit: Some(f32::INFINITY),
            ..ConfigPatch::default()
        };
        assert!(base.apply_patch(&bad).is_err());
        assert_eq!(base.speed_limit, FlockConfig::default().speed_limit);
    }

    #[test]
    fn scaled_factors_use_reference_units() {
        let config = FlockConfig::default().with_scaled_factors(2.0, 1.0, 0.5);
        assert!((config.cohesion_factor - 0.01).abs() < 1e-9);
        assert!((config.alignment_factor - 0.05).abs() < 1e-9);
        assert!((config.separation_factor - 0.025).abs() < 1e-9);
    }

    #[test]
    fn neighbor_scan_excludes_self_and_respects_radius() {
        let positions = vec![
            Position::new(0.0, 0.0),
            Position::new(3.0, 0.0),
            Position::new(0.0, 4.9),
            Position::new(10.0, 0.0),
        ];
        let mut seen = Vec::new();
        visit_neighbors(&positions, 0, 5.0, &mut |other, dist_sq| {
            seen.push((other, dist_sq));
        });
        seen.sort_by_key(|(other, _)| *other);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert!((seen[0].1 - 9.0).abs() < 1e-6);
        assert_eq!(seen[1].0, 2);
    }

    #[test]
    fn neighbor_scan_is_strict_at_the_radius() {
        let positions = vec![Position::new(0.0, 0.0), Position::new(5.0, 0.0)];
        let mut count = 0;
        visit_neighbors(&positions, 0, 5.0, &mut |_, _| count += 1);
        assert_eq!(count, 0, "distance exactly equal to the radius is outside");
    }

    #[test]
    fn speed_cap_preserves_direction() {
        let mut velocity = Velocity::new(30.0, 40.0);
        cap_speed(&mut velocity, 15.0);
        assert!((velocity.speed() - 15.0).abs() < 1e-4);
        assert!((velocity.dx / velocity.dy - 0.75).abs() < 1e-5);

        let mut slow = Velocity::new(1.0, 1.0);
        cap_speed(&mut slow, 15.0);
        assert_eq!(slow, Velocity::new(1.0, 1.0));
    }

    #[test]
    fn lone_agent_interaction_rules_are_inert() {
        let config = FlockConfig::default();
        // Mid-world, clear of the containment bands.
        let positions = vec![Position::new(500.0, 500.0)];
        let velocities = vec![Velocity::new(3.0, -2.0)];
        let steered = steer_agent(&config, &positions, &velocities, 0);
        assert_eq!(steered, velocities[0]);
    }

    #[test]
    fn containment_nudges_toward_the_interior() {
        let config = FlockConfig::default();
        let positions = vec![Position::new(10.0, 990.0)];
        let velocities = vec![Velocity::new(0.0, 0.0)];
        let steered = steer_agent(&config, &positions, &velocities, 0);
        assert!(steered.dx > 0.0, "low-x band pushes right");
        assert!(steered.dy < 0.0, "high-y band pushes down");
    }

    #[test]
    fn containment_never_exceeds_the_speed_cap() {
        let config = FlockConfig {
            turn_factor: 10.0,
            ..FlockConfig::default()
        };
        let positions = vec![Position::new(10.0, 10.0)];
        let velocities = vec![Velocity::new(15.0, 0.0)];
        let steered = steer_agent(&config, &positions, &velocities, 0);
        assert!(steered.speed() <= config.speed_limit + 1e-4);
    }

    #[test]
    fn order_parameters_empty_store_is_none() {
        assert!(OrderParameters::measure(&[], &[]).is_none());
    }

    #[test]
    fn mean_velocity_magnitude_uses_the_unnormalized_sum() {
        let positions = vec![Position::new(0.0, 0.0), Position::new(1.0, 0.0)];
        let velocities = vec![Velocity::new(1.0, 0.0), Velocity::new(1.0, 0.0)];
        let order = OrderParameters::measure(&positions, &velocities).expect("order");
        assert!((order.velocity - 2.0).abs() < 1e-6);
        assert!((order.mean_velocity.dx - 1.0).abs() < 1e-6);
        assert!((order.mean_velocity.dy).abs() < 1e-6);
    }

    #[test]
    fn polarization_of_aligned_headings_is_one() {
        let positions = vec![Position::new(0.0, 0.0); 4];
        let velocities = vec![Velocity::new(2.0, 0.0); 4];
        let order = OrderParameters::measure(&positions, &velocities).expect("order");
        assert!((order.polarization - 1.0).abs() < 1e-6);
    }

    #[test]
    fn polarization_of_cancelling_headings_is_zero() {
        let positions = vec![Position::new(0.0, 0.0); 2];
        let velocities = vec![Velocity::new(1.0, 0.0), Velocity::new(-1.0, 0.0)];
        let order = OrderParameters::measure(&positions, &velocities).expect("order");
        assert!(order.polarization.abs() < 1e-6);
    }

    #[test]
    fn stationary_agents_are_skipped_not_zeroed() {
        let positions = vec![Position::new(0.0, 0.0), Position::new(1.0, 0.0)];
        let velocities = vec![Velocity::new(0.0, 0.0), Velocity::new(3.0, 0.0)];
        let order = OrderParameters::measure(&positions, &velocities).expect("order");
        // One unit heading over n = 2.
        assert!((order.polarization - 0.5).abs() < 1e-6);
    }

    #[test]
    fn rotation_order_matches_a_hand_computed_case() {
        // Center of mass at (1, 0); agent 0 has r = (-1, 0), u = (1, 0);
        // agent 1 has r = (1, 0), u = (0, 1). Terms: -1 and 0.
        let positions = vec![Position::new(0.0, 0.0), Position::new(2.0, 0.0)];
        let velocities = vec![Velocity::new(4.0, 0.0), Velocity::new(0.0, 4.0)];
        let order = OrderParameters::measure(&positions, &velocities).expect("order");
        assert!((order.rotation_order - 0.5).abs() < 1e-6);
    }

    #[test]
    fn quantization_clamps_and_bounds_error() {
        let extent = 500.0;
        assert_eq!(quantize_coord(-25.0, extent), 0);
        assert_eq!(quantize_coord(extent + 25.0, extent), u16::MAX);
        assert_eq!(quantize_coord(0.0, extent), 0);
        assert_eq!(quantize_coord(extent, extent), u16::MAX);

        let bound = extent / 65_536.0;
        for raw in [0.0f32, 0.37, 123.456, 250.0, 499.99] {
            let round_trip = dequantize_coord(quantize_coord(raw, extent), extent);
            assert!(
                (round_trip - raw).abs() <= bound,
                "value {raw} round-tripped to {round_trip}"
            );
        }
    }

    #[test]
    fn encoded_positions_decode_to_little_endian_pairs() {
        let positions = vec![Position::new(0.0, 250.0), Position::new(500.0, 0.0)];
        let blob = encode_positions(&positions, 500.0, 500.0);
        let bytes = STANDARD.decode(blob).expect("valid base64");
        assert_eq!(bytes.len(), positions.len() * 4);
        let first_x = u16::from_le_bytes([bytes[0], bytes[1]]);
        let first_y = u16::from_le_bytes([bytes[2], bytes[3]]);
        let second_x = u16::from_le_bytes([bytes[4], bytes[5]]);
        assert_eq!(first_x, 0);
        assert_eq!(first_y, 32_768);
        assert_eq!(second_x, u16::MAX);
    }

    #[test]
    fn throttle_is_time_based_not_tick_based() {
        let mut throttle = TelemetryThrottle::from_rate(2.0);
        let mut emissions = 0;
        let mut now_ms = 0u64;
        while now_ms < 2_000 {
            if throttle.should_emit(now_ms) {
                emissions += 1;
            }
            now_ms += 16;
        }
        assert!(
            (3..=5).contains(&emissions),
            "expected ~4 emissions over 2 s of 16 ms ticks, got {emissions}"
        );
    }

    #[test]
    fn zero_rate_throttle_never_emits() {
        let mut throttle = TelemetryThrottle::from_rate(0.0);
        for now_ms in (0..10_000).step_by(100) {
            assert!(!throttle.should_emit(now_ms));
        }
    }

    #[test]
    fn trails_are_bounded_sliding_windows() {
        let mut columns = ParticleColumns::new();
        columns.push(Position::new(0.0, 0.0), Velocity::new(1.0, 0.0));
        for _ in 0..(TRAIL_CAPACITY + 10) {
            columns.integrate();
            columns.record_trails();
        }
        let trail = &columns.trails()[0];
        assert_eq!(trail.len(), TRAIL_CAPACITY);
        // Oldest surviving entry is from the 11th integration.
        assert!((trail.front().expect("front").x - 11.0).abs() < 1e-6);
        assert!((trail.back().expect("back").x - 60.0).abs() < 1e-6);
    }

    #[test]
    fn spawn_draws_inside_world_bounds() {
        let config = FlockConfig {
            num_boids: 200,
            width: 320.0,
            height: 240.0,
            rng_seed: Some(11),
            ..FlockConfig::default()
        };
        let sim = Simulation::new(config).expect("sim");
        for position in sim.columns().positions() {
            assert!((0.0..320.0).contains(&position.x));
            assert!((0.0..240.0).contains(&position.y));
        }
        for velocity in sim.columns().velocities() {
            assert!(velocity.dx.abs() <= INITIAL_SPEED_SPREAD);
            assert!(velocity.dy.abs() <= INITIAL_SPEED_SPREAD);
        }
    }

    #[test]
    fn empty_population_steps_without_order_parameters() {
        let mut sim = Simulation::new(quiet_config()).expect("sim");
        let summary = sim.step();
        assert_eq!(summary.agent_count, 0);
        assert!(summary.order.is_none());
        let payload = sim.telemetry_payload(true, 0);
        assert_eq!(payload.n, 0);
        assert_eq!(payload.data.as_deref(), Some(""));
    }

    #[test]
    fn history_is_bounded_by_capacity() {
        let config = FlockConfig {
            num_boids: 3,
            history_capacity: 4,
            rng_seed: Some(5),
            ..FlockConfig::default()
        };
        let mut sim = Simulation::new(config).expect("sim");
        for _ in 0..10 {
            sim.step();
        }
        assert_eq!(sim.history().count(), 4);
        assert_eq!(sim.latest_summary().expect("latest").step, 10);
    }

    #[test]
    fn resize_keeps_agents_in_place() {
        let config = FlockConfig {
            num_boids: 8,
            rng_seed: Some(3),
            ..FlockConfig::default()
        };
        let mut sim = Simulation::new(config).expect("sim");
        let before = sim.columns().positions().to_vec();
        sim.resize(200.0, 200.0).expect("resize");
        assert_eq!(sim.columns().positions(), &before[..]);
        assert_eq!(sim.config().width, 200.0);
        assert!(sim.resize(0.0, 100.0).is_err());
    }

    #[test]
    fn telemetry_payload_serializes_with_wire_names() {
        let config = FlockConfig {
            num_boids: 2,
            rng_seed: Some(9),
            ..FlockConfig::default()
        };
        let sim = Simulation::new(config).expect("sim");
        let payload = sim.telemetry_payload(true, 125);
        let json = serde_json::to_value(&payload).expect("json");
        assert_eq!(json["tMs"], 125);
        assert_eq!(json["stepCount"], 0);
        assert_eq!(json["format"], "u16xy");
        assert_eq!(json["n"], 2);
        assert!(json["params"]["cohesionFactor"].is_number());
        assert!(json["rotationOrder"].is_number());
        assert!(json["vector"]["dx"].is_number());
        assert!(json["data"].is_string());

        let meta = sim.telemetry_payload(false, 0);
        let json = serde_json::to_value(&meta).expect("json");
        assert_eq!(json["format"], "meta");
        assert!(json.get("data").is_none());
    }
}
