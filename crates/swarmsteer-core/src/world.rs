//! The swarm world: agent storage plus the per-tick steering pipeline.
//!
//! `tick` runs eight stages in strict dependency order. Policy,
//! perception, separation, and integration are parallel over fixed-size
//! chunks of the dense agent arrays; target caching, grid build, path
//! replanning, and path following run single-threaded. Stages communicate
//! only through per-agent columns written by earlier stages, the shared
//! target cache, and the frame budget counters.

use crate::arena::{AgentArena, AgentColumns, AgentInit, PathState, PathWindow};
use crate::buckets::{bucket_key, BucketStore, ReplanRequest};
use crate::path::{
    compute_repath_cooldown, quantize_cache_cell, PathCache, PathCacheKey, SharedPathPoints,
};
use crate::services::{NavMeshService, PathFindingMode, SwarmServices, TickInput};
use crate::telemetry::FrameTelemetry;
use crate::{agent_hash, AgentId, SwarmConfig, WorldError};
use glam::{Vec2, Vec3};
use ordered_float::OrderedFloat;
use rand::Rng;
use rand::rngs::SmallRng;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use swarmsteer_grid::SpatialHashGrid;
use tracing::trace;

/// Frame deltas are clamped to this before any stage runs.
const MAX_TICK_DT: f32 = 0.05;

/// Vertical band applied to every grid query.
const Z_HALF_HEIGHT: f32 = 120.0;

/// Extra spacing added on top of two agent radii before pushing apart.
const SEPARATION_SKIN: f32 = 10.0;

// Policy distance tiers (squared) and density tiers (agents per m²).
const POLICY_NEAR_SQ: f32 = 1500.0 * 1500.0;
const POLICY_FAR_SQ: f32 = 4000.0 * 4000.0;
const DENSE_PER_M2: f32 = 3.0;
const VERY_DENSE_PER_M2: f32 = 6.0;

// Separation skips extra frames for agents far from the target.
const SEPARATION_MID_SQ: f32 = 1500.0 * 1500.0;
const SEPARATION_FAR_SQ: f32 = 3000.0 * 3000.0;

// Chunk-stagger periods per stage.
const POLICY_STAGGER: u32 = 30;
const REPLAN_STAGGER: u32 = 8;
const SEPARATION_STAGGER: u32 = 3;
const FOLLOW_STAGGER: u32 = 2;

// Replan triggers.
const IDLE_REPATH_AGE_SECONDS: f32 = 2.5;
const NO_LOS_REPATH_SECONDS: f32 = 0.25;
const ASYNC_HIERARCHICAL_DISTANCE: f32 = 3000.0;
const ASYNC_RETRY_COOLDOWN: f32 = 0.25;

// Integration constants.
const VELOCITY_INTERP_RATE: f32 = 6.0;
const CURVATURE_SPEED_K: f32 = 120.0;
const KINDA_SMALL: f32 = 1e-4;

// Target projection and tolerance (stage 0).
const TARGET_PROJECT_EXTENT: Vec3 = Vec3::new(3000.0, 3000.0, 10_000.0);
const TARGET_XY_TOLERANCE: f32 = 5.0;
const TARGET_Z_TOLERANCE: f32 = 50.0;

// Agent-side LOS projection extent (stage 3).
const LOS_PROJECT_EXTENT: Vec3 = Vec3::new(50.0, 50.0, 100.0);

// Escalating reprojection extents (stage 7).
const REPROJECT_EXTENT_SMALL: Vec3 = Vec3::new(100.0, 100.0, 200.0);
const REPROJECT_EXTENT_MEDIUM: Vec3 = Vec3::new(400.0, 400.0, 400.0);
const REPROJECT_EXTENT_LARGE: Vec3 = Vec3::new(1200.0, 1200.0, 800.0);

/// Per-tick snapshot of the chase target, shared by every stage.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetCache {
    /// Raw target world position.
    pub position: Vec3,
    /// 2D projection of `position`.
    pub position_2d: Vec2,
    /// Navmesh projection of the target, or the raw position when the
    /// projection failed.
    pub nav_position: Vec3,
    /// True when the target stands on the navmesh within tolerance.
    pub on_navmesh: bool,
    /// World time of the last refresh; gates idempotence within a tick.
    pub last_update_seconds: f64,
}

impl Default for TargetCache {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            position_2d: Vec2::ZERO,
            nav_position: Vec3::ZERO,
            on_navmesh: false,
            last_update_seconds: -1.0,
        }
    }
}

/// Budgeted per-frame work counters, shared across parallel chunks.
#[derive(Debug, Default)]
struct FrameCounters {
    los_checks: AtomicU32,
    repaths: AtomicU32,
}

fn try_consume(counter: &AtomicU32, cap: u32) -> bool {
    // Compare the pre-increment value against the cap so concurrent
    // consumers can never push the counter past it.
    let mut used = counter.load(Ordering::Relaxed);
    loop {
        if used >= cap {
            return false;
        }
        match counter.compare_exchange_weak(used, used + 1, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(current) => used = current,
        }
    }
}

impl FrameCounters {
    fn los_used(&self) -> u32 {
        self.los_checks.load(Ordering::Relaxed)
    }

    fn repaths_used(&self) -> u32 {
        self.repaths.load(Ordering::Relaxed)
    }

    fn try_consume_los(&self, cap: u32) -> bool {
        try_consume(&self.los_checks, cap)
    }

    fn try_consume_repath(&self, cap: u32) -> bool {
        try_consume(&self.repaths, cap)
    }
}

#[inline]
fn dist2d_sq(a: Vec3, b: Vec3) -> f32 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    dx * dx + dy * dy
}

#[inline]
fn dist2d(a: Vec3, b: Vec3) -> f32 {
    dist2d_sq(a, b).sqrt()
}

#[inline]
fn normalize2d(v: Vec3) -> Vec2 {
    v.truncate().normalize_or_zero()
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Frame-rate-independent first-order approach of `current` to `target`.
fn interp_to(current: Vec2, target: Vec2, dt: f32, speed: f32) -> Vec2 {
    if speed <= 0.0 {
        return target;
    }
    let delta = target - current;
    if delta.length_squared() < 1e-8 {
        return target;
    }
    current + delta * (dt * speed).clamp(0.0, 1.0)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// A chunk runs a staggered stage only on its phase frame, keyed on the
/// chunk's first agent so phases spread across chunks.
fn chunk_allows(frame: u32, first_agent: AgentId, period: u32) -> bool {
    period <= 1 || frame % period == agent_hash(first_agent) % period
}

/// Density-adaptive neighbor cap for separation queries.
fn neighbor_cap(estimated_density: f32, max_neighbors: u32) -> u32 {
    if estimated_density >= VERY_DENSE_PER_M2 {
        ((max_neighbors as f32 * 0.5).floor() as u32).max(4)
    } else if estimated_density >= DENSE_PER_M2 {
        ((max_neighbors as f32 * 0.75).floor() as u32).max(4)
    } else {
        max_neighbors
    }
}

/// Speed multiplier derived from the path window's curvature.
fn curvature_speed_scale(curvature: f32) -> f32 {
    (1.0 / (1.0 + CURVATURE_SPEED_K * curvature)).clamp(0.55, 1.0)
}

/// A path counts as fresh while its age stays under a travel-time window
/// derived from the remaining distance (clamped to 2–10 seconds).
fn is_path_fresh(path: &PathState, self_pos: Vec3, fallback_goal: Vec3, max_speed: f32) -> bool {
    let dist = if path.has_path {
        dist2d(self_pos, path.last_goal)
    } else {
        dist2d(self_pos, fallback_goal)
    };
    let travel_ms = dist / (max_speed * 0.60).max(1.0) * 1000.0;
    let max_path_age_ms = travel_ms.clamp(2000.0, 10_000.0);
    path.has_path && path.path_age * 1000.0 <= max_path_age_ms && path.index < path.num_points()
}

/// Index of the 2D-nearest path point, never below 1 for lists with more
/// than one point.
fn find_nearest_point_index_2d(points: &[Vec3], pos: Vec3) -> usize {
    if points.len() <= 1 {
        return 0;
    }
    let mut best = 1;
    let mut best_dist_sq = f32::MAX;
    for (k, point) in points.iter().enumerate().skip(1) {
        let d = dist2d_sq(*point, pos);
        if d < best_dist_sq {
            best_dist_sq = d;
            best = k;
        }
    }
    best
}

/// Fill the 3-point window from the agent's current waypoint, deriving
/// the 2D tangent and a curvature magnitude of `sin θ / |v01|`.
fn build_window(path: &PathState, window: &mut PathWindow) {
    let np = path.num_points();
    let clamp_idx = |idx: usize| idx.min(np.saturating_sub(1));

    let i0 = clamp_idx(path.index);
    let i1 = clamp_idx(i0 + 1);
    let i2 = clamp_idx(i1 + 1);

    let p0 = path.point(i0);
    let p1 = path.point(i1);
    let p2 = path.point(i2);

    let v01 = (p1 - p0).truncate();
    let v12 = (p2 - p1).truncate();
    let l01_sq = v01.length_squared();
    let l12_sq = v12.length_squared();

    let mut tangent = Vec2::ZERO;
    let mut curvature = 0.0;
    if l01_sq > 1e-6 {
        let inv01 = l01_sq.sqrt().recip();
        tangent = v01 * inv01;
        if l12_sq > 1e-6 {
            let inv12 = l12_sq.sqrt().recip();
            let sin_theta = v01.perp_dot(v12).abs() * inv01 * inv12;
            curvature = sin_theta * inv01;
        }
    }

    window.p0 = p0;
    window.p1 = p1;
    window.p2 = p2;
    window.tangent = tangent;
    window.curvature = curvature;
    window.valid = true;
}

fn project_escalating(nav: &dyn NavMeshService, point: Vec3) -> Option<Vec3> {
    nav.project_point(point, REPROJECT_EXTENT_SMALL)
        .or_else(|| nav.project_point(point, REPROJECT_EXTENT_MEDIUM))
        .or_else(|| nav.project_point(point, REPROJECT_EXTENT_LARGE))
}

/// Aggregate world state: agent storage plus everything the pipeline
/// owns between ticks.
pub struct SwarmWorld {
    config: SwarmConfig,
    agents: AgentArena,
    grid: SpatialHashGrid<AgentId>,
    target: TargetCache,
    path_cache: PathCache,
    buckets: BucketStore,
    counters: FrameCounters,
    telemetry: FrameTelemetry,
    rng: SmallRng,
    last_los_reset_frame: Option<u32>,
    last_repath_reset_frame: Option<u32>,
    reproject_slot: AtomicU32,
}

impl std::fmt::Debug for SwarmWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmWorld")
            .field("agent_count", &self.agents.len())
            .field("target", &self.target)
            .field("path_cache_len", &self.path_cache.len())
            .finish()
    }
}

impl SwarmWorld {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: SwarmConfig) -> Result<Self, WorldError> {
        config.validate()?;
        let grid = SpatialHashGrid::new(config.cell_size)
            .map_err(|_| WorldError::InvalidConfig("cell_size must be positive"))?;
        let path_cache = PathCache::new(
            config.path_cache_ttl,
            config.key_solve_cooldown,
            config.path_cache_max_entries,
        );
        let rng = config.seeded_rng();
        Ok(Self {
            config,
            agents: AgentArena::new(),
            grid,
            target: TargetCache::default(),
            path_cache,
            buckets: BucketStore::new(),
            counters: FrameCounters::default(),
            telemetry: FrameTelemetry::default(),
            rng,
            last_los_reset_frame: None,
            last_repath_reset_frame: None,
            reproject_slot: AtomicU32::new(0),
        })
    }

    /// Returns an immutable reference to the configuration.
    #[must_use]
    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Read-only access to the agent arena.
    #[must_use]
    pub fn agents(&self) -> &AgentArena {
        &self.agents
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// The target snapshot from the most recent tick.
    #[must_use]
    pub fn target_cache(&self) -> &TargetCache {
        &self.target
    }

    /// Telemetry for the most recent tick.
    #[must_use]
    pub fn telemetry(&self) -> &FrameTelemetry {
        &self.telemetry
    }

    /// Diagnostic read access to the spatial grid as built this tick.
    #[must_use]
    pub fn grid(&self) -> &SpatialHashGrid<AgentId> {
        &self.grid
    }

    /// Number of shared paths currently cached.
    #[must_use]
    pub fn path_cache_len(&self) -> usize {
        self.path_cache.len()
    }

    /// Spawn an agent at `position` with default state and a randomized
    /// lane bias, returning its handle.
    pub fn spawn_agent(&mut self, position: Vec3) -> AgentId {
        let lane_sign = if self.rng.random_bool(0.5) { 1.0 } else { -1.0 };
        let lane_mag = self.rng.random_range(0.0..=1.0);
        self.agents.insert(AgentInit {
            position,
            radius: self.config.movement.agent_radius,
            lane_sign,
            lane_mag,
        })
    }

    /// Remove an agent by handle. Returns false for stale handles.
    pub fn remove_agent(&mut self, id: AgentId) -> bool {
        self.agents.remove(id)
    }

    /// Execute one pipeline tick.
    ///
    /// `dt` is clamped to at most 0.05 s. A zero `dt` only refreshes the
    /// target cache; agent state is untouched.
    pub fn tick(&mut self, input: &TickInput, services: &SwarmServices<'_>) {
        let dt = input.dt.clamp(0.0, MAX_TICK_DT);
        let frame = (input.world_seconds * 60.0).floor() as u32;
        let now = input.world_seconds;

        self.telemetry = FrameTelemetry::default();
        if services.nav.is_none() {
            trace!("navmesh service unavailable; path stages fail open this tick");
        }

        let t = Instant::now();
        self.stage_cache_target(input, services);
        self.telemetry.timings.target_cache_ms = elapsed_ms(t);

        if dt > 0.0 {
            let t = Instant::now();
            self.stage_build_grid();
            self.telemetry.timings.build_grid_ms = elapsed_ms(t);

            let t = Instant::now();
            self.stage_update_policy(frame);
            self.telemetry.timings.update_policy_ms = elapsed_ms(t);

            let t = Instant::now();
            self.stage_perception(frame, dt, services);
            self.telemetry.timings.perception_ms = elapsed_ms(t);

            let t = Instant::now();
            self.stage_path_replan(frame, dt, now, services);
            self.telemetry.timings.path_replan_ms = elapsed_ms(t);

            let t = Instant::now();
            self.stage_separation(frame);
            self.telemetry.timings.separation_ms = elapsed_ms(t);

            let t = Instant::now();
            self.stage_follow(frame, dt, services);
            self.telemetry.timings.follow_ms = elapsed_ms(t);

            let t = Instant::now();
            self.stage_integrate(frame, dt, services);
            self.telemetry.timings.integrate_ms = elapsed_ms(t);
        }

        self.telemetry.los_checks_used = self.counters.los_used();
        self.telemetry.repaths_used = self.counters.repaths_used();
        self.telemetry.agent_count = self.agents.len();
    }

    /// Basic motor: apply each agent's published move target to its
    /// transform. Hosts with their own character controller skip this.
    pub fn apply_move_targets(&mut self) {
        let (_, columns) = self.agents.parts_mut();
        let AgentColumns {
            positions,
            move_targets,
            ..
        } = columns;
        for (position, move_target) in positions.iter_mut().zip(move_targets.iter()) {
            *position = move_target.center;
        }
    }

    /// Stage 0: snapshot the target and its navmesh projection.
    fn stage_cache_target(&mut self, input: &TickInput, services: &SwarmServices<'_>) {
        if self.target.last_update_seconds == input.world_seconds {
            return;
        }
        let raw = input.target_position;
        let mut projected = raw;
        let mut on_navmesh = false;
        if let Some(nav) = services.nav {
            if let Some(location) = nav.project_point(raw, TARGET_PROJECT_EXTENT) {
                projected = location;
                let xy_sq = dist2d_sq(raw, location);
                let dz = (raw.z - location.z).abs();
                on_navmesh =
                    xy_sq <= TARGET_XY_TOLERANCE * TARGET_XY_TOLERANCE && dz <= TARGET_Z_TOLERANCE;
            }
        }
        self.target = TargetCache {
            position: raw,
            position_2d: raw.truncate(),
            nav_position: projected,
            on_navmesh,
            last_update_seconds: input.world_seconds,
        };
    }

    /// Stage 1: rebuild the spatial hash from current positions.
    fn stage_build_grid(&mut self) {
        self.grid.reset();
        let handles = self.agents.handles();
        let positions = self.agents.columns().positions();
        for (id, position) in handles.iter().zip(positions) {
            self.grid.insert(*id, *position);
        }
    }

    /// Stage 2: classify agents into update tiers by distance and density.
    fn stage_update_policy(&mut self, frame: u32) {
        let chunk = self.config.chunk_size.max(1);
        let cell = self.config.cell_size;
        let area_per_cell = (cell * cell * 1e-4).max(1e-3);
        let count_radius = 0.6 * cell;
        let target_pos = self.target.position;
        let grid = &self.grid;
        let grid_empty = grid.is_empty();

        let (handles, columns) = self.agents.parts_mut();
        let AgentColumns {
            positions, policy, ..
        } = columns;

        policy
            .par_chunks_mut(chunk)
            .zip(positions.as_slice().par_chunks(chunk))
            .zip(handles.par_chunks(chunk))
            .for_each(|((policy_chunk, pos_chunk), id_chunk)| {
                if !chunk_allows(frame, id_chunk[0], POLICY_STAGGER) {
                    return;
                }
                for (policy, &pos) in policy_chunk.iter_mut().zip(pos_chunk) {
                    let d2 = dist2d_sq(pos, target_pos);
                    let count = if grid_empty {
                        0
                    } else {
                        grid.estimate_count_at(pos, count_radius, Z_HALF_HEIGHT)
                    };
                    let density = if count > 0 {
                        count as f32 / area_per_cell
                    } else {
                        0.0
                    };

                    let mut separation_mask = 0u8;
                    let mut follow_mask = 0u8;
                    let mut sense_mask = 0u8;

                    if density >= VERY_DENSE_PER_M2 {
                        separation_mask = 0x3;
                    } else if density >= DENSE_PER_M2 {
                        separation_mask = 0x1;
                    }

                    if d2 >= POLICY_FAR_SQ {
                        follow_mask = 0x3;
                        sense_mask = 0x7;
                    } else if d2 >= POLICY_NEAR_SQ {
                        follow_mask = 0x1;
                        sense_mask = 0x1;
                    }

                    let mut cooldown_scale = 1.0;
                    if d2 >= POLICY_NEAR_SQ {
                        cooldown_scale *= if d2 >= POLICY_FAR_SQ { 2.0 } else { 1.5 };
                    }
                    if density >= VERY_DENSE_PER_M2 {
                        cooldown_scale *= 1.5;
                    }

                    policy.dist_to_target_sq = d2;
                    policy.estimated_density = density;
                    policy.cooldown_scale = cooldown_scale;
                    policy.separation_mask = separation_mask;
                    policy.follow_mask = follow_mask;
                    policy.sense_mask = sense_mask;
                }
            });
    }

    /// Stage 3: budgeted, phased line-of-sight refreshes.
    fn stage_perception(&mut self, frame: u32, dt: f32, services: &SwarmServices<'_>) {
        if self.last_los_reset_frame != Some(frame) {
            self.counters.los_checks.store(0, Ordering::Relaxed);
            self.last_los_reset_frame = Some(frame);
        }
        if services.nav.is_none() && services.physics.is_none() {
            return;
        }

        let chunk = self.config.chunk_size.max(1);
        let movement = self.config.movement;
        let budget = movement.los_checks_per_frame_budget;
        let chase_sq = movement.direct_chase_range * movement.direct_chase_range;
        let refresh_seconds = movement.los_refresh_seconds;
        let z_offset = Vec3::new(0.0, 0.0, movement.los_height_offset);

        let target_pos = self.target.position;
        let target_nav = self.target.nav_position;
        let target_on_mesh = self.target.on_navmesh;
        let counters = &self.counters;
        let nav = services.nav;
        let physics = services.physics;

        // None means no service could answer; the agent keeps its state.
        let compute_los = |from: Vec3| -> Option<bool> {
            if target_on_mesh {
                if let Some(nav) = nav {
                    if let Some(from_nav) = nav.project_point(from, LOS_PROJECT_EXTENT) {
                        return Some(nav.nav_raycast(from_nav, target_nav).is_none());
                    }
                }
            }
            let physics = physics?;
            let start = from + z_offset;
            let end = target_pos + z_offset;
            match physics.line_trace(start, end) {
                None => Some(true),
                Some(hit) => Some(hit.hit_target),
            }
        };

        let (handles, columns) = self.agents.parts_mut();
        let AgentColumns {
            positions,
            policy,
            los,
            sense,
            stamps,
            ..
        } = columns;

        los.par_chunks_mut(chunk)
            .zip(sense.par_chunks_mut(chunk))
            .zip(stamps.par_chunks_mut(chunk))
            .zip(positions.as_slice().par_chunks(chunk))
            .zip(policy.as_slice().par_chunks(chunk))
            .zip(handles.par_chunks(chunk))
            .for_each(
                |(((((los_chunk, sense_chunk), stamp_chunk), pos_chunk), policy_chunk), ids)| {
                    for i in 0..los_chunk.len() {
                        let stamp = &mut stamp_chunk[i];
                        stamp.did_replan = false;
                        stamp.did_los_refresh = false;

                        let sense = &mut sense_chunk[i];
                        sense.target_position = target_pos;

                        let los = &mut los_chunk[i];
                        los.time_since_refresh += dt;

                        let sense_this_frame =
                            (frame & u32::from(policy_chunk[i].sense_mask)) == 0;
                        let in_chase_range = policy_chunk[i].dist_to_target_sq <= chase_sq;
                        if !sense_this_frame || !in_chase_range {
                            sense.los = los.has_los;
                            sense.los_updated = false;
                            continue;
                        }

                        let hash = agent_hash(ids[i]);
                        let phase = (hash & 0xFF) as f32 * (refresh_seconds / 256.0);
                        let due = los.time_since_refresh + phase >= refresh_seconds;
                        let mut los_now = los.has_los;

                        if due && counters.try_consume_los(budget) {
                            los.time_since_refresh = 0.0;
                            if let Some(visible) = compute_los(pos_chunk[i]) {
                                los_now = visible;
                                los.has_los = visible;
                                stamp.did_los_refresh = true;
                            }
                        }

                        sense.los = los_now;
                        sense.los_updated = stamp.did_los_refresh;
                    }
                },
            );
    }

    /// Stage 4: group agents by (start, goal) cells and publish shared
    /// paths from the TTL cache or budgeted synchronous solves.
    fn stage_path_replan(&mut self, frame: u32, dt: f32, now: f64, services: &SwarmServices<'_>) {
        if self.last_repath_reset_frame != Some(frame) {
            self.counters.repaths.store(0, Ordering::Relaxed);
            self.last_repath_reset_frame = Some(frame);
        }
        let Some(nav) = services.nav else {
            return;
        };

        let chunk = self.config.chunk_size.max(1);
        let movement = self.config.movement;
        let budget = movement.repaths_per_frame_budget;
        let end_radius_sq =
            movement.end_of_path_repath_radius * movement.end_of_path_repath_radius;
        let cache_cell = self.config.path_cache_cell_size;
        let cache_z = self.config.path_cache_z_cell_size;

        let target = self.target.clone();
        let have_goal = target.on_navmesh
            || target.nav_position.distance_squared(target.position) > 1.0;
        let final_goal = if have_goal {
            target.nav_position
        } else {
            target.position
        };
        let goal_cell = quantize_cache_cell(final_goal, cache_cell, cache_z);

        let counters = &self.counters;
        let path_cache = &mut self.path_cache;
        let (handles, columns) = self.agents.parts_mut();
        let AgentColumns {
            positions,
            radii,
            path,
            stamps,
            sense,
            policy,
            ..
        } = columns;

        let n = handles.len();
        let mut groups: HashMap<PathCacheKey, Vec<(usize, f32)>> = HashMap::new();

        for chunk_start in (0..n).step_by(chunk) {
            if !chunk_allows(frame, handles[chunk_start], REPLAN_STAGGER) {
                continue;
            }
            let chunk_end = (chunk_start + chunk).min(n);
            groups.clear();

            for i in chunk_start..chunk_end {
                let state = &mut path[i];
                state.path_age += dt;
                state.repath_cooldown = (state.repath_cooldown - dt).max(0.0);

                if (frame & u32::from(policy[i].follow_mask)) != 0 || !have_goal {
                    continue;
                }

                let np = state.num_points();
                let out_of_path = !state.has_path || state.index >= np;
                let cooldown_elapsed = state.repath_cooldown <= 0.0;
                let cell_unchanged =
                    quantize_cache_cell(state.last_goal, cache_cell, cache_z) == goal_cell;
                let dist_sq = dist2d_sq(positions[i], final_goal);
                let min_goal_move = 2.0 * radii[i];
                let goal_moved = !cell_unchanged
                    && state.last_goal.distance_squared(final_goal)
                        > min_goal_move * min_goal_move;

                let on_last_segment =
                    state.has_path && (np <= 2 || state.index >= np.saturating_sub(2).max(1));
                let near_end = on_last_segment && dist_sq <= end_radius_sq;
                state.no_los_time = if near_end && !sense[i].los {
                    state.no_los_time + dt
                } else {
                    0.0
                };
                let force_no_los = near_end && state.no_los_time > NO_LOS_REPATH_SECONDS;
                let idle_stale = state.path_age >= IDLE_REPATH_AGE_SECONDS;

                if out_of_path || (cooldown_elapsed && goal_moved) || force_no_los || idle_stale {
                    let key = PathCacheKey {
                        start: quantize_cache_cell(positions[i], cache_cell, cache_z),
                        goal: goal_cell,
                    };
                    groups.entry(key).or_default().push((i, dist_sq));
                }
            }

            if groups.is_empty() || counters.repaths_used() >= budget {
                continue;
            }

            for (&key, members) in &groups {
                if counters.repaths_used() >= budget {
                    break;
                }

                let mut shared = path_cache.lookup_fresh(key, now);
                if shared.is_none() {
                    if path_cache.solve_on_cooldown(key, now) {
                        continue;
                    }
                    // One synchronous solve for the whole group, from its
                    // closest-to-goal representative.
                    let representative = members
                        .iter()
                        .min_by_key(|member| OrderedFloat(member.1))
                        .expect("non-empty group");
                    let rep_start = positions[representative.0];
                    if let Some(points) = nav.find_path_sync(rep_start, final_goal) {
                        if points.len() >= 2 && counters.try_consume_repath(budget) {
                            let shared_points: SharedPathPoints = points.into();
                            path_cache.insert(key, shared_points.clone(), now);
                            shared = Some(shared_points);
                        }
                    }
                }

                let Some(shared) = shared else { continue };
                for &(i, dist_sq) in members {
                    let state = &mut path[i];
                    state.points = Some(shared.clone());
                    state.index = 1;
                    state.has_path = true;
                    state.last_goal = final_goal;
                    state.repath_cooldown =
                        compute_repath_cooldown(dist_sq.sqrt(), agent_hash(handles[i]));
                    state.path_age = 0.0;
                    stamps[i].did_replan = true;
                }
            }
        }
    }

    /// Stage 5: density-adaptive neighbor scan accumulating separation.
    fn stage_separation(&mut self, frame: u32) {
        let chunk = self.config.chunk_size.max(1);
        let movement = self.config.movement;
        let query_radius = movement.neighbor_radius;
        let query_area_m2 =
            (std::f32::consts::PI * query_radius * query_radius * 1e-4).max(1e-6);
        let sum_radius = 2.0 * movement.agent_radius + SEPARATION_SKIN;
        let max_neighbors = movement.max_neighbors;
        let grid = &self.grid;

        let (handles, columns) = self.agents.parts_mut();
        let AgentColumns {
            positions,
            steering,
            policy,
            ..
        } = columns;

        steering
            .par_chunks_mut(chunk)
            .zip(positions.as_slice().par_chunks(chunk))
            .zip(policy.as_slice().par_chunks(chunk))
            .zip(handles.par_chunks(chunk))
            .for_each(|(((steer_chunk, pos_chunk), policy_chunk), ids)| {
                if !chunk_allows(frame, ids[0], SEPARATION_STAGGER) {
                    return;
                }
                for i in 0..steer_chunk.len() {
                    let id = ids[i];
                    let hash = agent_hash(id);
                    let d2 = policy_chunk[i].dist_to_target_sq;

                    // Far agents separate on a sparser cadence.
                    if d2 > SEPARATION_FAR_SQ {
                        if (frame.wrapping_add(hash & 3) & 3) != 0 {
                            continue;
                        }
                    } else if d2 > SEPARATION_MID_SQ
                        && (frame.wrapping_add(hash & 1) & 1) != 0
                    {
                        continue;
                    }
                    let mask = u32::from(policy_chunk[i].separation_mask);
                    if mask != 0 && (frame.wrapping_add(hash & mask) & mask) != 0 {
                        continue;
                    }

                    let cap = neighbor_cap(policy_chunk[i].estimated_density, max_neighbors);
                    let steer = &mut steer_chunk[i];
                    if cap == 0 {
                        steer.separation = Vec2::ZERO;
                        steer.neighbor_count = 0;
                        steer.local_density = 0.0;
                        continue;
                    }

                    let self_pos = pos_chunk[i];
                    let mut separation = Vec2::ZERO;
                    let mut count = 0u32;

                    grid.visit_nearby(
                        self_pos,
                        query_radius,
                        Z_HALF_HEIGHT,
                        Some(cap as usize),
                        |entry| {
                            if entry.key == id {
                                return true;
                            }
                            let dx = entry.position.x - self_pos.x;
                            let dy = entry.position.y - self_pos.y;
                            let dist_sq = dx * dx + dy * dy;
                            if dist_sq > KINDA_SMALL && dist_sq < sum_radius * sum_radius {
                                let d = dist_sq.sqrt();
                                let inv = 1.0 / (d + KINDA_SMALL);
                                let push_dir = Vec2::new(-dx * inv, -dy * inv);
                                let over = sum_radius - d;
                                let strength = 1.0 - d / sum_radius;
                                separation += push_dir * (over * 8.0 + strength * 25.0);
                            }
                            count += 1;
                            true
                        },
                    );

                    steer.separation = separation;
                    steer.neighbor_count = count;
                    steer.local_density = if count > 0 {
                        count as f32 / query_area_m2
                    } else {
                        policy_chunk[i].estimated_density
                    };
                }
            });
    }

    /// Stage 6: waypoint selection, direct chase, lane spread, and the
    /// bucketed async replan path for long distances.
    fn stage_follow(&mut self, frame: u32, dt: f32, services: &SwarmServices<'_>) {
        self.buckets.begin_frame(frame);

        let chunk = self.config.chunk_size.max(1);
        let movement = self.config.movement;
        let budget = movement.repaths_per_frame_budget;
        let acceptance_sq =
            movement.waypoint_acceptance_radius * movement.waypoint_acceptance_radius;
        let chase_sq = movement.direct_chase_range * movement.direct_chase_range;
        let bucket_cell = self.config.follow_bucket_cell_size;
        let max_buckets = self.config.max_buckets_per_frame;
        let move_threshold = self.config.replan_goal_move_threshold;

        let mut direct_chase_count = 0u32;
        let mut age_accum = 0.0f64;
        let mut age_count = 0u32;

        let counters = &self.counters;
        let buckets = &mut self.buckets;
        let nav = services.nav;
        let (handles, columns) = self.agents.parts_mut();
        let AgentColumns {
            positions,
            motion,
            path,
            steering,
            windows,
            stamps,
            policy,
            sense,
            ..
        } = columns;

        let n = handles.len();
        for chunk_start in (0..n).step_by(chunk) {
            if !chunk_allows(frame, handles[chunk_start], FOLLOW_STAGGER) {
                continue;
            }
            let chunk_end = (chunk_start + chunk).min(n);

            for i in chunk_start..chunk_end {
                let self_pos = positions[i];
                if path[i].has_path && path[i].index >= path[i].num_points() {
                    path[i].has_path = false;
                }

                let mut fresh =
                    is_path_fresh(&path[i], self_pos, sense[i].target_position, movement.max_speed);
                let key = bucket_key(self_pos, bucket_cell);

                if !fresh {
                    if let Some(points) = buckets.result_for(key) {
                        let np = points.len();
                        let state = &mut path[i];
                        state.points = Some(points.clone());
                        state.index =
                            find_nearest_point_index_2d(points, self_pos).clamp(1, np - 1);
                        state.has_path = np > 1;
                        state.path_age = 0.0;
                        state.last_goal = sense[i].target_position;
                        fresh = state.has_path;
                    }
                }

                if !fresh {
                    let goal_moved = dist2d(sense[i].target_position, path[i].last_goal);
                    let np = path[i].num_points();
                    let should_replan =
                        !path[i].has_path || path[i].index >= np || goal_moved >= move_threshold;

                    if should_replan
                        && path[i].repath_cooldown <= 0.0
                        && (frame & u32::from(policy[i].follow_mask)) == 0
                        && counters.repaths_used() < budget
                    {
                        if let Some(nav) = nav {
                            let dist_to_goal = dist2d(self_pos, sense[i].target_position);
                            let mode = if dist_to_goal > ASYNC_HIERARCHICAL_DISTANCE {
                                PathFindingMode::Hierarchical
                            } else {
                                PathFindingMode::Regular
                            };
                            match buckets.request(
                                nav,
                                self_pos,
                                sense[i].target_position,
                                key,
                                mode,
                                max_buckets,
                            ) {
                                ReplanRequest::Scheduled => {
                                    counters.try_consume_repath(budget);
                                    path[i].repath_cooldown = ASYNC_RETRY_COOLDOWN;
                                    stamps[i].did_replan = true;
                                }
                                ReplanRequest::Coalesced => {
                                    path[i].repath_cooldown = ASYNC_RETRY_COOLDOWN;
                                    stamps[i].did_replan = true;
                                }
                                ReplanRequest::Denied => {}
                            }
                        }
                    }

                    path[i].path_age += dt;
                    if path[i].repath_cooldown > 0.0 {
                        path[i].repath_cooldown = (path[i].repath_cooldown - dt).max(0.0);
                    }
                    age_accum += f64::from(path[i].path_age);
                    age_count += 1;
                    continue;
                }

                let mut target_point = path[i].point(path[i].index);
                if dist2d_sq(self_pos, target_point) <= acceptance_sq {
                    let state = &mut path[i];
                    state.index = (state.index + 1).min(state.num_points() - 1);
                    state.path_age = 0.0;
                    target_point = state.point(state.index);
                }

                let np = path[i].num_points();
                let on_last_segment = np <= 2 || path[i].index >= np.saturating_sub(2).max(1);
                let close =
                    dist2d_sq(self_pos, sense[i].target_position) <= chase_sq;
                let direct = sense[i].los && on_last_segment && close;

                if direct {
                    target_point = sense[i].target_position;
                    path[i].last_goal = sense[i].target_position;
                    windows[i].valid = false;
                    direct_chase_count += 1;
                } else if (frame & u32::from(policy[i].follow_mask)) == 0 {
                    build_window(&path[i], &mut windows[i]);
                }

                let dist_to_target = dist2d(self_pos, target_point);
                let mut path_dir = normalize2d(target_point - self_pos);

                if !direct && dist_to_target > movement.path_spread_min_distance {
                    let clamped = dist_to_target.min(movement.path_spread_max_distance);
                    let alpha = (clamped - movement.path_spread_min_distance)
                        / (movement.path_spread_max_distance - movement.path_spread_min_distance)
                            .max(1.0);
                    let spread = movement.path_spread_max_offset
                        * alpha
                        * motion[i].lane_mag
                        * motion[i].lane_sign;
                    if spread != 0.0 {
                        let right = path_dir.normalize_or_zero().perp();
                        path_dir =
                            normalize2d(target_point + (right * spread).extend(0.0) - self_pos);
                    }
                }

                let density = steering[i].local_density;
                let deemphasis = if density >= VERY_DENSE_PER_M2 {
                    0.6
                } else if density >= DENSE_PER_M2 {
                    0.8
                } else {
                    1.0
                };
                steering[i].path_dir = path_dir;
                steering[i].path_weight = movement.path_follow_weight * deemphasis;

                path[i].path_age += dt;
                if path[i].repath_cooldown > 0.0 {
                    path[i].repath_cooldown = (path[i].repath_cooldown - dt).max(0.0);
                }
                age_accum += f64::from(path[i].path_age);
                age_count += 1;
            }
        }

        self.telemetry.direct_chase_count = direct_chase_count;
        self.telemetry.avg_path_age_sec = if age_count > 0 {
            (age_accum / f64::from(age_count)) as f32
        } else {
            0.0
        };
    }

    /// Stage 7: steering blend, speed/turn limits, yielding, and
    /// navmesh reprojection; publishes the per-agent move target.
    fn stage_integrate(&mut self, frame: u32, dt: f32, services: &SwarmServices<'_>) {
        let chunk = self.config.chunk_size.max(1);
        let movement = self.config.movement;
        let max_speed = movement.max_speed;
        let max_neighbors = movement.max_neighbors.max(1);
        let dense_enter = (0.6 * max_neighbors as f32).ceil() as u32;
        let crowd_relaxed_below = (0.4 * max_neighbors as f32).ceil() as u32;
        let yield_radius = movement.agent_radius.max(100.0);
        let target_pos = self.target.position;
        let target_2d = self.target.position_2d;
        let nav = services.nav;
        let reproject_slot = &self.reproject_slot;

        let (handles, columns) = self.agents.parts_mut();
        let AgentColumns {
            positions,
            facings,
            motion,
            path,
            steering,
            windows,
            sense,
            progress,
            move_targets,
            ..
        } = columns;

        motion
            .par_chunks_mut(chunk)
            .zip(steering.par_chunks_mut(chunk))
            .zip(facings.par_chunks_mut(chunk))
            .zip(progress.par_chunks_mut(chunk))
            .zip(move_targets.par_chunks_mut(chunk))
            .zip(positions.as_slice().par_chunks(chunk))
            .zip(path.as_slice().par_chunks(chunk))
            .zip(sense.as_slice().par_chunks(chunk))
            .zip(windows.as_slice().par_chunks(chunk))
            .zip(handles.par_chunks(chunk))
            .for_each(
                |(
                    (
                        (
                            (
                                (
                                    ((((motion_chunk, steer_chunk), facing_chunk), prog_chunk),
                                        move_chunk),
                                    pos_chunk,
                                ),
                                path_chunk,
                            ),
                            sense_chunk,
                        ),
                        window_chunk,
                    ),
                    ids,
                )| {
                    for i in 0..motion_chunk.len() {
                        let self_pos = pos_chunk[i];
                        let self_2d = self_pos.truncate();
                        let motion = &mut motion_chunk[i];
                        let steer = &mut steer_chunk[i];
                        let prog = &mut prog_chunk[i];

                        prog.since_progress_sec += dt;
                        if prog.since_progress_sec >= 0.25 {
                            let moved_sq = (self_2d - prog.last_pos_2d).length_squared();
                            if moved_sq >= 400.0 {
                                prog.last_pos_2d = self_2d;
                                prog.distance_moved_2d = 0.0;
                                prog.likely_stuck = false;
                            } else {
                                prog.likely_stuck = true;
                            }
                            prog.since_progress_sec = 0.0;
                        }

                        let fwd = facing_chunk[i];

                        if !is_path_fresh(
                            &path_chunk[i],
                            self_pos,
                            sense_chunk[i].target_position,
                            max_speed,
                        ) {
                            steer.separation = Vec2::ZERO;
                            steer.path_dir = Vec2::ZERO;
                            steer.path_weight = 0.0;
                            motion.velocity = Vec2::ZERO;
                            move_chunk[i].center = self_pos;
                            move_chunk[i].forward = fwd;
                            move_chunk[i].distance_to_goal = 0.0;
                            continue;
                        }

                        // Yield gate near the target.
                        let dz_to_target = (self_pos.z - target_pos.z).abs();
                        let enter_r = 2.0 * yield_radius;
                        let exit_r = 2.4 * yield_radius;
                        let near_enter = (self_2d - target_2d).length_squared()
                            <= enter_r * enter_r
                            && dz_to_target <= Z_HALF_HEIGHT;
                        let near_exit = (self_2d - target_2d).length_squared() <= exit_r * exit_r
                            && dz_to_target <= Z_HALF_HEIGHT;

                        let dense = steer.neighbor_count >= dense_enter;
                        let speed_2d = motion.velocity.length();
                        let sep_mag = steer.separation.length();
                        let slow = speed_2d <= 10.0;
                        let pressured =
                            sep_mag >= 0.25 * max_speed && speed_2d <= 0.2 * max_speed;
                        let enter_yield = near_enter && dense && (slow || pressured);

                        motion.yield_time_remaining =
                            (motion.yield_time_remaining - dt).max(0.0);

                        if !motion.yielding && enter_yield {
                            motion.yielding = true;
                            motion.yield_time_remaining = 0.40;
                        } else if motion.yielding {
                            let crowd_relaxed = steer.neighbor_count < crowd_relaxed_below;
                            if motion.yield_time_remaining <= 0.0 && (crowd_relaxed || !near_exit)
                            {
                                motion.yielding = false;
                            }
                        }

                        if motion.yielding {
                            steer.separation = Vec2::ZERO;
                            steer.path_dir = Vec2::ZERO;
                            steer.path_weight = 0.0;
                            motion.velocity = Vec2::ZERO;

                            let mut desired_pos = self_pos;
                            if let Some(nav) = nav {
                                if let Some(location) = project_escalating(nav, desired_pos) {
                                    desired_pos = location;
                                    motion.last_projected = location;
                                }
                            }
                            move_chunk[i].center = desired_pos;
                            move_chunk[i].forward = fwd;
                            move_chunk[i].distance_to_goal = 0.0;
                            continue;
                        }

                        let neighbor_frac =
                            (steer.neighbor_count as f32 / max_neighbors as f32).clamp(0.0, 1.0);
                        let density_frac = if steer.local_density > 0.0 {
                            (steer.local_density / 2.5).clamp(0.0, 1.0)
                        } else {
                            neighbor_frac
                        };

                        let period: u32 = if density_frac >= 0.85 {
                            4
                        } else if density_frac >= 0.60 {
                            2
                        } else {
                            1
                        };
                        let hash = agent_hash(ids[i]);
                        let decimate = period > 1
                            && frame.wrapping_add(hash & (period - 1)) % period != 0;
                        if decimate {
                            motion.velocity *= 0.90;
                            move_chunk[i].center = self_pos;
                            move_chunk[i].forward = fwd;
                            move_chunk[i].distance_to_goal = 0.0;
                            continue;
                        }

                        steer.path_weight *= 1.0 - 0.5 * density_frac;

                        let desired_vel = steer.separation * movement.separation_weight
                            + steer.path_dir * max_speed * steer.path_weight;

                        let curv_scale = if window_chunk[i].valid {
                            curvature_speed_scale(window_chunk[i].curvature)
                        } else {
                            1.0
                        };
                        let density_scale = lerp(1.0, 0.6, density_frac);
                        let max_speed_this_frame = max_speed * curv_scale * density_scale;
                        let turn_limit_deg = lerp(720.0, 180.0, density_frac);

                        if desired_vel.length() * dt <= 0.5 {
                            motion.velocity *= 0.90;
                            move_chunk[i].center = self_pos;
                            move_chunk[i].forward = fwd;
                            move_chunk[i].distance_to_goal = 0.0;
                            continue;
                        }

                        let blended =
                            interp_to(motion.velocity, desired_vel, dt, VELOCITY_INTERP_RATE);
                        motion.velocity = blended.clamp_length_max(max_speed_this_frame);

                        let target_dir = if motion.velocity.length_squared() <= 1e-8 {
                            fwd
                        } else {
                            motion.velocity.normalize()
                        };
                        let turn_cap_rad = turn_limit_deg.to_radians() * dt;
                        let cos_cap = turn_cap_rad.cos();
                        let dot = fwd.dot(target_dir).clamp(-1.0, 1.0);
                        if dot < cos_cap {
                            let angle = dot.acos();
                            let t = (turn_cap_rad / angle.max(KINDA_SMALL)).min(1.0);
                            let new_fwd = (fwd * (1.0 - t) + target_dir * t).normalize_or_zero();
                            if new_fwd != Vec2::ZERO {
                                facing_chunk[i] = new_fwd;
                            }
                        }

                        let mut desired_pos = self_pos + motion.velocity.extend(0.0) * dt;

                        // Reprojection slack tightens as the agent slows.
                        let last_projected = motion.last_projected;
                        let drift_xy_sq = dist2d_sq(self_pos, last_projected);
                        let drift_z = (self_pos.z - last_projected.z).abs();
                        let speed_now = motion.velocity.length();
                        let xy_slack = (120.0 - 0.5 * speed_now).clamp(60.0, 120.0);
                        let z_slack = (20.0 - 0.05 * speed_now).clamp(10.0, 20.0);
                        let needs_reproject =
                            drift_xy_sq > xy_slack * xy_slack || drift_z > z_slack;
                        let slot = reproject_slot.fetch_add(1, Ordering::Relaxed);
                        let have_budget = frame.wrapping_add(slot & 0x3) % 4 == 0;

                        if needs_reproject && have_budget {
                            if let Some(nav) = nav {
                                if let Some(location) = project_escalating(nav, desired_pos) {
                                    desired_pos = location;
                                    motion.last_projected = location;
                                }
                            }
                        }

                        let forward = if motion.velocity.length_squared() <= 1e-8 {
                            fwd
                        } else {
                            motion.velocity.normalize()
                        };
                        move_chunk[i].center = desired_pos;
                        move_chunk[i].forward = forward;
                        move_chunk[i].distance_to_goal = motion.velocity.length() * dt;
                    }
                },
            );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{NavAgentConfig, PathQueryCallback, PhysicsService, TraceHit};
    use std::sync::Mutex;

    /// Flat navmesh covering everything: projections succeed in place,
    /// raycasts are unblocked, sync solves return a straight segment.
    #[derive(Default)]
    struct FlatNav {
        project_calls: Mutex<u32>,
    }

    impl NavMeshService for FlatNav {
        fn project_point(&self, point: Vec3, _extent: Vec3) -> Option<Vec3> {
            *self.project_calls.lock().unwrap() += 1;
            Some(point)
        }

        fn nav_raycast(&self, _from: Vec3, _to: Vec3) -> Option<Vec3> {
            None
        }

        fn find_path_sync(&self, from: Vec3, to: Vec3) -> Option<Vec<Vec3>> {
            Some(vec![from, to])
        }

        fn find_path_async(
            &self,
            _agent: NavAgentConfig,
            _from: Vec3,
            _to: Vec3,
            _mode: PathFindingMode,
            _on_complete: PathQueryCallback,
        ) {
        }

        fn default_agent_config(&self) -> NavAgentConfig {
            NavAgentConfig {
                radius: 55.0,
                height: 180.0,
            }
        }
    }

    struct OpenPhysics;

    impl PhysicsService for OpenPhysics {
        fn line_trace(&self, _from: Vec3, _to: Vec3) -> Option<TraceHit> {
            None
        }
    }

    fn seeded_world() -> SwarmWorld {
        SwarmWorld::new(SwarmConfig {
            rng_seed: Some(0xDEAD_BEEF),
            ..SwarmConfig::default()
        })
        .expect("world")
    }

    #[test]
    fn spawn_assigns_lane_bias_in_range() {
        let mut world = seeded_world();
        for i in 0..32 {
            let id = world.spawn_agent(Vec3::new(i as f32 * 10.0, 0.0, 0.0));
            let index = world.agents().index_of(id).expect("index");
            let motion = &world.agents().columns().motion()[index];
            assert!(motion.lane_sign == 1.0 || motion.lane_sign == -1.0);
            assert!((0.0..=1.0).contains(&motion.lane_mag));
        }
        assert_eq!(world.agent_count(), 32);
    }

    #[test]
    fn seeded_worlds_assign_identical_lane_bias() {
        let mut a = seeded_world();
        let mut b = seeded_world();
        for i in 0..8 {
            let pos = Vec3::new(i as f32, 0.0, 0.0);
            let id_a = a.spawn_agent(pos);
            let id_b = b.spawn_agent(pos);
            let ia = a.agents().index_of(id_a).unwrap();
            let ib = b.agents().index_of(id_b).unwrap();
            assert_eq!(
                a.agents().columns().motion()[ia].lane_sign,
                b.agents().columns().motion()[ib].lane_sign
            );
            assert_eq!(
                a.agents().columns().motion()[ia].lane_mag,
                b.agents().columns().motion()[ib].lane_mag
            );
        }
    }

    #[test]
    fn target_cache_is_idempotent_within_one_world_time() {
        let nav = FlatNav::default();
        let services = SwarmServices {
            nav: Some(&nav),
            physics: None,
        };
        let mut world = seeded_world();
        let input = TickInput {
            dt: 0.0,
            world_seconds: 1.0,
            target_position: Vec3::new(500.0, 0.0, 0.0),
        };

        world.tick(&input, &services);
        let first = world.target_cache().clone();
        let calls_after_first = *nav.project_calls.lock().unwrap();

        world.tick(&input, &services);
        assert_eq!(world.target_cache(), &first);
        assert_eq!(*nav.project_calls.lock().unwrap(), calls_after_first);
        assert!(first.on_navmesh);
        assert_eq!(first.position_2d, Vec2::new(500.0, 0.0));
    }

    #[test]
    fn empty_world_tick_is_a_no_op() {
        let nav = FlatNav::default();
        let physics = OpenPhysics;
        let services = SwarmServices {
            nav: Some(&nav),
            physics: Some(&physics),
        };
        let mut world = seeded_world();

        for step in 1..=8u32 {
            world.tick(
                &TickInput {
                    dt: 1.0 / 60.0,
                    world_seconds: f64::from(step) / 60.0,
                    target_position: Vec3::new(1000.0, 0.0, 0.0),
                },
                &services,
            );
        }
        assert_eq!(world.telemetry().agent_count, 0);
        assert_eq!(world.telemetry().repaths_used, 0);
        assert_eq!(world.telemetry().los_checks_used, 0);
        assert_eq!(world.path_cache_len(), 0);
    }

    #[test]
    fn zero_dt_leaves_agent_state_untouched() {
        let nav = FlatNav::default();
        let services = SwarmServices {
            nav: Some(&nav),
            physics: None,
        };
        let mut world = seeded_world();
        let id = world.spawn_agent(Vec3::ZERO);

        world.tick(
            &TickInput {
                dt: 0.0,
                world_seconds: 0.5,
                target_position: Vec3::new(1000.0, 0.0, 0.0),
            },
            &services,
        );

        let index = world.agents().index_of(id).expect("index");
        let columns = world.agents().columns();
        assert_eq!(columns.positions()[index], Vec3::ZERO);
        assert_eq!(columns.motion()[index].velocity, Vec2::ZERO);
        assert_eq!(columns.path()[index].index, 0);
        assert_eq!(columns.path()[index].path_age, 0.0);
        // The target cache still refreshed.
        assert!(world.target_cache().last_update_seconds == 0.5);
    }

    #[test]
    fn chunk_stagger_fires_once_per_period() {
        let mut world = seeded_world();
        let id = world.spawn_agent(Vec3::ZERO);
        let fired: Vec<u32> = (0..60).filter(|&f| chunk_allows(f, id, 30)).collect();
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[1] - fired[0], 30);
        assert!((0..60).all(|f| chunk_allows(f, id, 1)));
    }

    #[test]
    fn curvature_clamp_matches_expected_values() {
        // 1 / (1 + 120 * 0.02) ≈ 0.294 clamps up to the 0.55 floor.
        assert_eq!(curvature_speed_scale(0.02), 0.55);
        assert_eq!(curvature_speed_scale(0.0), 1.0);
        let mid = curvature_speed_scale(0.002);
        assert!((mid - 1.0 / 1.24).abs() < 1e-6);
    }

    #[test]
    fn neighbor_cap_scales_with_density() {
        assert_eq!(neighbor_cap(0.0, 8), 8);
        assert_eq!(neighbor_cap(3.5, 8), 6);
        assert_eq!(neighbor_cap(7.0, 8), 4);
        // The floor keeps very dense crowds from starving the scan.
        assert_eq!(neighbor_cap(7.0, 4), 4);
        assert_eq!(neighbor_cap(0.0, 0), 0);
    }

    #[test]
    fn path_freshness_window_scales_with_distance() {
        let points: SharedPathPoints = vec![Vec3::ZERO, Vec3::new(10_000.0, 0.0, 0.0)].into();
        let mut path = PathState {
            points: Some(points),
            index: 1,
            has_path: true,
            last_goal: Vec3::new(10_000.0, 0.0, 0.0),
            ..PathState::default()
        };

        // Far goal: the age window saturates at 10 s.
        path.path_age = 9.5;
        assert!(is_path_fresh(&path, Vec3::ZERO, Vec3::ZERO, 330.0));
        path.path_age = 10.5;
        assert!(!is_path_fresh(&path, Vec3::ZERO, Vec3::ZERO, 330.0));

        // Near goal: the window floors at 2 s.
        path.last_goal = Vec3::new(100.0, 0.0, 0.0);
        path.path_age = 1.9;
        assert!(is_path_fresh(&path, Vec3::ZERO, Vec3::ZERO, 330.0));
        path.path_age = 2.1;
        assert!(!is_path_fresh(&path, Vec3::ZERO, Vec3::ZERO, 330.0));

        path.has_path = false;
        assert!(!is_path_fresh(&path, Vec3::ZERO, Vec3::ZERO, 330.0));
    }

    #[test]
    fn window_curvature_for_a_right_angle_turn() {
        let points: SharedPathPoints = vec![
            Vec3::ZERO,
            Vec3::new(100.0, 0.0, 0.0),
            Vec3::new(100.0, 100.0, 0.0),
        ]
        .into();
        let path = PathState {
            points: Some(points),
            index: 0,
            has_path: true,
            ..PathState::default()
        };
        let mut window = PathWindow::default();
        build_window(&path, &mut window);

        assert!(window.valid);
        assert_eq!(window.tangent, Vec2::X);
        // sin(90°) / |v01| = 1 / 100.
        assert!((window.curvature - 0.01).abs() < 1e-6);

        // A straight path has zero curvature.
        let straight: SharedPathPoints = vec![
            Vec3::ZERO,
            Vec3::new(100.0, 0.0, 0.0),
            Vec3::new(200.0, 0.0, 0.0),
        ]
        .into();
        let path = PathState {
            points: Some(straight),
            index: 0,
            has_path: true,
            ..PathState::default()
        };
        build_window(&path, &mut window);
        assert_eq!(window.curvature, 0.0);
    }

    #[test]
    fn interp_to_approaches_without_overshoot() {
        let current = Vec2::new(0.0, 0.0);
        let target = Vec2::new(100.0, 0.0);
        let one_step = interp_to(current, target, 1.0 / 60.0, 6.0);
        assert!(one_step.x > 0.0 && one_step.x < 100.0);

        // A large dt*speed product snaps to the target instead of passing it.
        assert_eq!(interp_to(current, target, 1.0, 6.0), target);
        assert_eq!(interp_to(target, target, 0.1, 6.0), target);
    }

    #[test]
    fn budget_counter_never_exceeds_cap() {
        let counter = AtomicU32::new(0);
        let consumed: u32 = (0..100).map(|_| u32::from(try_consume(&counter, 64))).sum();
        assert_eq!(consumed, 64);
        assert_eq!(counter.load(Ordering::Relaxed), 64);
        assert!(!try_consume(&counter, 64));
    }
}
