//! Core types and the per-tick steering pipeline for the swarm simulator.
//!
//! The simulation steers thousands of agents toward a single moving target
//! over a navigable mesh while respecting per-frame compute budgets. Each
//! tick runs a staged pipeline: target caching, spatial grid rebuild, an
//! update-policy pass that tiers agents by distance and density, budgeted
//! line-of-sight perception, coalesced path replanning with a TTL cache,
//! grid-based local separation, path following with lane spread and a
//! curvature window, and finally velocity/facing integration.
//!
//! External collaborators (navmesh, physics) are trait objects passed into
//! [`SwarmWorld::tick`]; when absent the affected stages fail open.

use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{Key, new_key_type};
use thiserror::Error;

mod arena;
mod buckets;
mod path;
mod services;
mod telemetry;
mod world;

pub use arena::{
    AgentArena, AgentColumns, BudgetStamp, LosState, MotionState, MoveTarget, PathState,
    PathWindow, PolicyState, ProgressState, SteeringAccum, TargetSense,
};
pub use path::SharedPathPoints;
pub use services::{
    NavAgentConfig, NavMeshService, PathFindingMode, PathQueryCallback, PhysicsService,
    SwarmServices, TickInput, TraceHit,
};
pub use telemetry::{FrameTelemetry, StageTimings};
pub use world::{SwarmWorld, TargetCache};

pub use swarmsteer_grid::{GridEntry, SpatialHashGrid};

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

/// Convenience alias for associating side data with agents.
pub type AgentMap<T> = slotmap::SecondaryMap<AgentId, T>;

/// 32-bit avalanche hash of an agent handle.
///
/// Used wherever per-agent phasing needs a well-mixed value: LOS refresh
/// phases, chunk stagger, decimation offsets, and repath cooldown jitter.
#[must_use]
pub fn agent_hash(id: AgentId) -> u32 {
    let mut k = id.data().as_ffi();
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    (k as u32) ^ ((k >> 32) as u32)
}

/// Errors that can occur when constructing world state.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Steering constants shared by every agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MovementParams {
    /// Top speed in world units per second.
    pub max_speed: f32,
    /// Scale applied to the accumulated separation push.
    pub separation_weight: f32,
    /// Scale applied to the path-follow steering direction.
    pub path_follow_weight: f32,
    /// Neighbor query radius for local separation.
    pub neighbor_radius: f32,
    /// Collision radius assigned to spawned agents.
    pub agent_radius: f32,
    /// Baseline neighbor cap for separation queries.
    pub max_neighbors: u32,
    /// Distance at which the current waypoint is considered reached.
    pub waypoint_acceptance_radius: f32,
    /// Radius around the goal that counts as "near the end of the path".
    pub end_of_path_repath_radius: f32,
    /// Z lift applied to both ends of the fallback line-of-sight trace.
    pub los_height_offset: f32,
    /// Range within which an agent with line of sight chases directly.
    pub direct_chase_range: f32,
    /// Maximum lateral lane-spread offset.
    pub path_spread_max_offset: f32,
    /// Distance at which lane spread starts ramping in.
    pub path_spread_min_distance: f32,
    /// Distance at which lane spread reaches its maximum.
    pub path_spread_max_distance: f32,
    /// Synchronous + asynchronous path solves allowed per frame.
    pub repaths_per_frame_budget: u32,
    /// Line-of-sight checks allowed per frame.
    pub los_checks_per_frame_budget: u32,
    /// Nominal interval between per-agent LOS refreshes.
    pub los_refresh_seconds: f32,
}

impl Default for MovementParams {
    fn default() -> Self {
        Self {
            max_speed: 330.0,
            separation_weight: 450.0,
            path_follow_weight: 3.0,
            neighbor_radius: 80.0,
            agent_radius: 55.0,
            max_neighbors: 4,
            waypoint_acceptance_radius: 180.0,
            end_of_path_repath_radius: 700.0,
            los_height_offset: 60.0,
            direct_chase_range: 1400.0,
            path_spread_max_offset: 120.0,
            path_spread_min_distance: 600.0,
            path_spread_max_distance: 3000.0,
            repaths_per_frame_budget: 256,
            los_checks_per_frame_budget: 64,
            los_refresh_seconds: 0.35,
        }
    }
}

/// Static configuration for a swarm world.
///
/// Distances are in world units (1 unit = 1 cm); densities derived from
/// them are converted to agents per square meter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Shared steering constants.
    pub movement: MovementParams,
    /// Edge length of one spatial hash cell.
    pub cell_size: f32,
    /// XY quantization cell for path cache keys.
    pub path_cache_cell_size: f32,
    /// Z quantization cell for path cache keys.
    pub path_cache_z_cell_size: f32,
    /// Seconds a cached shared path stays reusable.
    pub path_cache_ttl: f64,
    /// Minimum seconds between synchronous solves for one cache key.
    pub key_solve_cooldown: f64,
    /// Maximum number of cached shared paths before LRU eviction.
    pub path_cache_max_entries: usize,
    /// Edge length of the coarse buckets used to coalesce async replans.
    pub follow_bucket_cell_size: f32,
    /// Asynchronous bucket solves allowed per frame.
    pub max_buckets_per_frame: u32,
    /// Goal movement (2D) that justifies an async replan.
    pub replan_goal_move_threshold: f32,
    /// Agents per parallel work chunk. Chunk identity is stable within a
    /// run; chunk-level stagger is phased on the first agent of a chunk.
    pub chunk_size: usize,
    /// Optional RNG seed for reproducible lane-bias assignment.
    pub rng_seed: Option<u64>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            movement: MovementParams::default(),
            cell_size: 200.0,
            path_cache_cell_size: 500.0,
            path_cache_z_cell_size: 200.0,
            path_cache_ttl: 0.9,
            key_solve_cooldown: 0.20,
            path_cache_max_entries: 8192,
            follow_bucket_cell_size: 2500.0,
            max_buckets_per_frame: 32,
            replan_goal_move_threshold: 120.0,
            chunk_size: 256,
            rng_seed: None,
        }
    }
}

impl SwarmConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), WorldError> {
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(WorldError::InvalidConfig("cell_size must be positive"));
        }
        if self.path_cache_cell_size <= 0.0 || self.path_cache_z_cell_size <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "path cache cell sizes must be positive",
            ));
        }
        if self.follow_bucket_cell_size <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "follow_bucket_cell_size must be positive",
            ));
        }
        if self.path_cache_ttl < 0.0 || self.key_solve_cooldown < 0.0 {
            return Err(WorldError::InvalidConfig(
                "cache TTL and solve cooldown must be non-negative",
            ));
        }
        if self.path_cache_max_entries == 0 {
            return Err(WorldError::InvalidConfig(
                "path_cache_max_entries must be non-zero",
            ));
        }
        if self.chunk_size == 0 {
            return Err(WorldError::InvalidConfig("chunk_size must be non-zero"));
        }
        let movement = &self.movement;
        if movement.max_speed <= 0.0 {
            return Err(WorldError::InvalidConfig("max_speed must be positive"));
        }
        if movement.neighbor_radius <= 0.0 || movement.agent_radius <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "neighbor_radius and agent_radius must be positive",
            ));
        }
        if movement.waypoint_acceptance_radius <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "waypoint_acceptance_radius must be positive",
            ));
        }
        if movement.los_refresh_seconds <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "los_refresh_seconds must be positive",
            ));
        }
        if movement.path_spread_max_distance < movement.path_spread_min_distance {
            return Err(WorldError::InvalidConfig(
                "path_spread_max_distance must not be below path_spread_min_distance",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
    pub(crate) fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn default_config_validates() {
        assert!(SwarmConfig::default().validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = SwarmConfig::default();
        config.cell_size = 0.0;
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::default();
        config.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::default();
        config.movement.max_speed = -1.0;
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::default();
        config.movement.path_spread_max_distance = 100.0;
        config.movement.path_spread_min_distance = 600.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = SwarmConfig {
            rng_seed: Some(42),
            ..SwarmConfig::default()
        };
        let json = serde_json::to_string(&config).expect("serialize");
        let back: SwarmConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.movement, config.movement);
        assert_eq!(back.rng_seed, Some(42));
    }

    #[test]
    fn agent_hash_is_stable_and_spread() {
        let mut map: SlotMap<AgentId, ()> = SlotMap::with_key();
        let a = map.insert(());
        let b = map.insert(());
        assert_eq!(agent_hash(a), agent_hash(a));
        assert_ne!(agent_hash(a), agent_hash(b));
    }
}
