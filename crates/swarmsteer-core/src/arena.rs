//! Dense structure-of-arrays storage for per-agent simulation state.
//!
//! Fields are grouped the way the pipeline stages consume them; each group
//! lives in its own column so a stage can borrow exactly the columns it
//! reads and writes.

use crate::path::SharedPathPoints;
use crate::AgentId;
use glam::{Vec2, Vec3};
use slotmap::SlotMap;

/// Motion state owned by the integrate stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotionState {
    /// Current 2D velocity (z = 0 by convention).
    pub velocity: Vec2,
    /// Most recent successful navmesh projection of this agent.
    pub last_projected: Vec3,
    /// Lane-spread side, fixed at spawn: -1 or +1.
    pub lane_sign: f32,
    /// Lane-spread magnitude in [0, 1], fixed at spawn.
    pub lane_mag: f32,
    /// True while the agent holds position to let others pass.
    pub yielding: bool,
    /// Seconds the current yield hold has left.
    pub yield_time_remaining: f32,
}

/// Shared-path progress for one agent.
#[derive(Debug, Clone, Default)]
pub struct PathState {
    /// Refcounted immutable waypoint list, shared across agents.
    pub points: Option<SharedPathPoints>,
    /// Current waypoint index into `points`.
    pub index: usize,
    /// Goal position the path was solved for.
    pub last_goal: Vec3,
    /// Seconds since the path was (re)published.
    pub path_age: f32,
    /// Seconds until this agent may request another replan.
    pub repath_cooldown: f32,
    /// Seconds spent near the end of the path without line of sight.
    pub no_los_time: f32,
    /// Whether `points`/`index` currently describe a followable path.
    pub has_path: bool,
}

impl PathState {
    /// Number of points in the referenced list, zero when absent.
    #[must_use]
    pub fn num_points(&self) -> usize {
        self.points.as_ref().map_or(0, |points| points.len())
    }

    /// Waypoint at `index`; callers must keep `index` in bounds.
    #[must_use]
    pub fn point(&self, index: usize) -> Vec3 {
        self.points.as_ref().expect("path points")[index]
    }
}

/// Line-of-sight refresh state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LosState {
    /// Result of the most recent LOS check.
    pub has_los: bool,
    /// Seconds since that check ran.
    pub time_since_refresh: f32,
}

/// Separation / path-follow accumulator consumed by the integrate stage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SteeringAccum {
    /// Accumulated push away from overlapping neighbors.
    pub separation: Vec2,
    /// Unit direction toward the current steering target.
    pub path_dir: Vec2,
    /// Weight applied to `path_dir` when blending.
    pub path_weight: f32,
    /// Neighbors seen by the last separation scan.
    pub neighbor_count: u32,
    /// Local density in agents per square meter.
    pub local_density: f32,
}

/// Three consecutive path points with derived tangent and curvature.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PathWindow {
    pub p0: Vec3,
    pub p1: Vec3,
    pub p2: Vec3,
    /// Unit 2D tangent of the first window segment.
    pub tangent: Vec2,
    /// Curvature magnitude (sin of the turn angle over segment length).
    pub curvature: f32,
    pub valid: bool,
}

/// Per-tick booleans recording which budgeted work ran for an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetStamp {
    pub did_los_refresh: bool,
    pub did_replan: bool,
}

/// Update-policy classification for one agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyState {
    /// Squared 2D distance to the target.
    pub dist_to_target_sq: f32,
    /// Grid-estimated local density in agents per square meter.
    pub estimated_density: f32,
    /// Multiplier applied to replan cooldowns for far/dense agents.
    pub cooldown_scale: f32,
    /// Skip separation unless `(frame & mask) == 0` (hash-phased).
    pub separation_mask: u8,
    /// Skip follow/replan work unless `(frame & mask) == 0`.
    pub follow_mask: u8,
    /// Skip LOS refreshes unless `(frame & mask) == 0`.
    pub sense_mask: u8,
}

impl Default for PolicyState {
    fn default() -> Self {
        Self {
            dist_to_target_sq: f32::MAX,
            estimated_density: 0.0,
            cooldown_scale: 1.0,
            separation_mask: 0,
            follow_mask: 0,
            sense_mask: 0,
        }
    }
}

/// Target snapshot visible to one agent this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TargetSense {
    /// Target world position as of this tick.
    pub target_position: Vec3,
    /// Line-of-sight flag reported to downstream stages.
    pub los: bool,
    /// Whether `los` was refreshed this tick (false = carried over).
    pub los_updated: bool,
}

/// Movement-progress probe used to flag stuck agents.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressState {
    pub last_pos_2d: Vec2,
    pub distance_moved_2d: f32,
    pub since_progress_sec: f32,
    pub likely_stuck: bool,
}

/// Output consumed by the motion motor each tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MoveTarget {
    /// Desired world position after this tick.
    pub center: Vec3,
    /// Unit 2D facing to steer toward.
    pub forward: Vec2,
    /// Distance the agent intends to cover this tick.
    pub distance_to_goal: f32,
}

/// Initial per-agent values supplied by the spawner.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AgentInit {
    pub position: Vec3,
    pub radius: f32,
    pub lane_sign: f32,
    pub lane_mag: f32,
}

/// Collection of per-agent columns for hot-path iteration.
#[derive(Debug, Default)]
pub struct AgentColumns {
    pub(crate) positions: Vec<Vec3>,
    pub(crate) facings: Vec<Vec2>,
    pub(crate) radii: Vec<f32>,
    pub(crate) motion: Vec<MotionState>,
    pub(crate) path: Vec<PathState>,
    pub(crate) los: Vec<LosState>,
    pub(crate) steering: Vec<SteeringAccum>,
    pub(crate) windows: Vec<PathWindow>,
    pub(crate) stamps: Vec<BudgetStamp>,
    pub(crate) policy: Vec<PolicyState>,
    pub(crate) sense: Vec<TargetSense>,
    pub(crate) progress: Vec<ProgressState>,
    pub(crate) move_targets: Vec<MoveTarget>,
}

impl AgentColumns {
    /// Number of active rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if there are no active rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn push(&mut self, init: AgentInit) {
        self.positions.push(init.position);
        self.facings.push(Vec2::X);
        self.radii.push(init.radius);
        self.motion.push(MotionState {
            last_projected: init.position,
            lane_sign: init.lane_sign,
            lane_mag: init.lane_mag,
            ..MotionState::default()
        });
        self.path.push(PathState::default());
        self.los.push(LosState::default());
        self.steering.push(SteeringAccum::default());
        self.windows.push(PathWindow::default());
        self.stamps.push(BudgetStamp::default());
        self.policy.push(PolicyState::default());
        self.sense.push(TargetSense::default());
        self.progress.push(ProgressState {
            last_pos_2d: init.position.truncate(),
            ..ProgressState::default()
        });
        self.move_targets.push(MoveTarget {
            center: init.position,
            forward: Vec2::X,
            distance_to_goal: 0.0,
        });
        self.debug_assert_coherent();
    }

    fn swap_remove(&mut self, index: usize) {
        self.positions.swap_remove(index);
        self.facings.swap_remove(index);
        self.radii.swap_remove(index);
        self.motion.swap_remove(index);
        self.path.swap_remove(index);
        self.los.swap_remove(index);
        self.steering.swap_remove(index);
        self.windows.swap_remove(index);
        self.stamps.swap_remove(index);
        self.policy.swap_remove(index);
        self.sense.swap_remove(index);
        self.progress.swap_remove(index);
        self.move_targets.swap_remove(index);
        self.debug_assert_coherent();
    }

    /// Immutable access to world positions.
    #[must_use]
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    /// Immutable access to unit 2D facings.
    #[must_use]
    pub fn facings(&self) -> &[Vec2] {
        &self.facings
    }

    /// Immutable access to collision radii.
    #[must_use]
    pub fn radii(&self) -> &[f32] {
        &self.radii
    }

    /// Immutable access to motion state.
    #[must_use]
    pub fn motion(&self) -> &[MotionState] {
        &self.motion
    }

    /// Immutable access to path state.
    #[must_use]
    pub fn path(&self) -> &[PathState] {
        &self.path
    }

    /// Immutable access to LOS state.
    #[must_use]
    pub fn los(&self) -> &[LosState] {
        &self.los
    }

    /// Immutable access to the steering accumulators.
    #[must_use]
    pub fn steering(&self) -> &[SteeringAccum] {
        &self.steering
    }

    /// Immutable access to path windows.
    #[must_use]
    pub fn windows(&self) -> &[PathWindow] {
        &self.windows
    }

    /// Immutable access to per-tick budget stamps.
    #[must_use]
    pub fn stamps(&self) -> &[BudgetStamp] {
        &self.stamps
    }

    /// Immutable access to policy classifications.
    #[must_use]
    pub fn policy(&self) -> &[PolicyState] {
        &self.policy
    }

    /// Immutable access to per-agent target snapshots.
    #[must_use]
    pub fn sense(&self) -> &[TargetSense] {
        &self.sense
    }

    /// Immutable access to progress probes.
    #[must_use]
    pub fn progress(&self) -> &[ProgressState] {
        &self.progress
    }

    /// Immutable access to published move targets.
    #[must_use]
    pub fn move_targets(&self) -> &[MoveTarget] {
        &self.move_targets
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        let n = self.positions.len();
        debug_assert_eq!(n, self.facings.len());
        debug_assert_eq!(n, self.radii.len());
        debug_assert_eq!(n, self.motion.len());
        debug_assert_eq!(n, self.path.len());
        debug_assert_eq!(n, self.los.len());
        debug_assert_eq!(n, self.steering.len());
        debug_assert_eq!(n, self.windows.len());
        debug_assert_eq!(n, self.stamps.len());
        debug_assert_eq!(n, self.policy.len());
        debug_assert_eq!(n, self.sense.len());
        debug_assert_eq!(n, self.progress.len());
        debug_assert_eq!(n, self.move_targets.len());
    }
}

/// Dense SoA storage with generational handles for agent access.
#[derive(Debug, Default)]
pub struct AgentArena {
    slots: SlotMap<AgentId, usize>,
    handles: Vec<AgentId>,
    columns: AgentColumns,
}

impl AgentArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when no agents are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Active agent handles in dense iteration order.
    #[must_use]
    pub fn handles(&self) -> &[AgentId] {
        &self.handles
    }

    /// Borrow the underlying column storage.
    #[must_use]
    pub fn columns(&self) -> &AgentColumns {
        &self.columns
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: AgentId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns true if `id` refers to a live agent.
    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(id)
    }

    /// Split borrow for the pipeline: handles alongside mutable columns.
    pub(crate) fn parts_mut(&mut self) -> (&[AgentId], &mut AgentColumns) {
        (&self.handles, &mut self.columns)
    }

    pub(crate) fn insert(&mut self, init: AgentInit) -> AgentId {
        let index = self.columns.len();
        self.columns.push(init);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    pub(crate) fn remove(&mut self, id: AgentId) -> bool {
        let Some(index) = self.slots.remove(id) else {
            return false;
        };
        self.columns.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        true
    }
}
