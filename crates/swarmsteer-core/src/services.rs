//! External collaborator interfaces: navmesh queries and physics traces.
//!
//! The pipeline never owns these services; it borrows them for one tick
//! and fails open when they are absent. Implementations must be callable
//! from worker threads.

use glam::Vec3;

/// Pathfinding mode requested from the navmesh service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathFindingMode {
    Regular,
    /// Coarse hierarchical search, used for long-range replans.
    Hierarchical,
}

/// Agent dimensions forwarded to asynchronous path queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavAgentConfig {
    pub radius: f32,
    pub height: f32,
}

/// Completion callback for asynchronous path queries.
///
/// May fire on any thread; `None` or a list shorter than two points means
/// the solve failed and is discarded by the caller.
pub type PathQueryCallback = Box<dyn FnOnce(Option<Vec<Vec3>>) + Send + 'static>;

/// Navigation mesh operations the pipeline depends on.
pub trait NavMeshService: Send + Sync {
    /// Nearest on-mesh point within an axis-aligned extent, if any.
    fn project_point(&self, point: Vec3, extent: Vec3) -> Option<Vec3>;

    /// Straight-line visibility across the mesh. `None` means unblocked;
    /// `Some(hit)` is the first blocking location.
    fn nav_raycast(&self, from: Vec3, to: Vec3) -> Option<Vec3>;

    /// Synchronous path solve, at least two points on success.
    fn find_path_sync(&self, from: Vec3, to: Vec3) -> Option<Vec<Vec3>>;

    /// Asynchronous path solve; the callback must tolerate late delivery.
    fn find_path_async(
        &self,
        agent: NavAgentConfig,
        from: Vec3,
        to: Vec3,
        mode: PathFindingMode,
        on_complete: PathQueryCallback,
    );

    /// Default agent dimensions used for path queries.
    fn default_agent_config(&self) -> NavAgentConfig;
}

/// Result of a blocking line trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceHit {
    /// World position of the first hit.
    pub location: Vec3,
    /// True when the hit actor is the chase target itself.
    pub hit_target: bool,
}

/// Collision queries used as the line-of-sight fallback.
pub trait PhysicsService: Send + Sync {
    /// Trace a visibility line; `None` when nothing was hit.
    fn line_trace(&self, from: Vec3, to: Vec3) -> Option<TraceHit>;
}

/// Services available to one tick. Any of them may be absent.
#[derive(Clone, Copy, Default)]
pub struct SwarmServices<'a> {
    pub nav: Option<&'a dyn NavMeshService>,
    pub physics: Option<&'a dyn PhysicsService>,
}

impl<'a> SwarmServices<'a> {
    /// Services bundle with every collaborator missing.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            nav: None,
            physics: None,
        }
    }
}

/// Per-tick input from the game-loop driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickInput {
    /// Frame delta in seconds; the pipeline clamps it to at most 0.05.
    pub dt: f32,
    /// Monotonic world clock in seconds; drives the frame index.
    pub world_seconds: f64,
    /// Target ("player") world position this frame.
    pub target_position: Vec3,
}
